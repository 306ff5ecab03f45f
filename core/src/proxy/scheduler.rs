// Timers for the controller's event loop
//
// Every timer is a spawned sleep that posts a `ProxyEvent::Timer` tagged with
// the scheduler generation. Cancelling bumps the generation and aborts the
// tasks; anything that still slips through is stale and dropped on receipt.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::trace;

use super::ProxyEvent;
use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Periodic uptime accounting
    Uptime,
    /// Broker reconnection attempt
    Reconnect,
    /// Admit a replacement session
    Replace,
    /// Session answer deadline for one offer epoch
    AnswerTimeout { id: SessionId, epoch: u32 },
    /// Deadline for an answered session to open its data channel
    ChannelTimeout { id: SessionId },
}

pub struct Scheduler {
    events: mpsc::UnboundedSender<ProxyEvent>,
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(events: mpsc::UnboundedSender<ProxyEvent>) -> Self {
        Self {
            events,
            generation: 0,
            tasks: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Fire `timer` once after `delay`
    pub fn after(&mut self, delay: Duration, timer: TimerKind) {
        trace!("Scheduling {:?} in {:?}", timer, delay);
        let events = self.events.clone();
        let generation = self.generation;
        self.track(tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(ProxyEvent::Timer { generation, timer });
        }));
    }

    /// Fire `timer` every `period`, first after one period
    pub fn every(&mut self, period: Duration, timer: TimerKind) {
        trace!("Scheduling {:?} every {:?}", timer, period);
        let events = self.events.clone();
        let generation = self.generation;
        self.track(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if events.send(ProxyEvent::Timer { generation, timer }).is_err() {
                    return;
                }
            }
        }));
    }

    /// Abort every pending timer and invalidate anything already queued
    pub fn cancel_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.generation += 1;
    }

    pub fn pending(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
