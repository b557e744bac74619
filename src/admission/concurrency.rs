//! Bounded-concurrency admission with per-client fairness.
//!
//! The limiter tracks total and per-source-IP in-flight counts. A
//! request over either cap joins a bounded FIFO queue and is dispatched
//! strictly in arrival order as capacity frees up; when the queue is
//! full it is rejected outright. Admission hands out an RAII
//! [`InFlightPermit`] whose drop releases both counters, so completion,
//! errors and abrupt client disconnects all take the same release path.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Rejection returned when both caps are exceeded and the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("admission queue full")]
pub struct QueueFull;

struct Waiter {
    ip: IpAddr,
    tx: oneshot::Sender<InFlightPermit>,
}

struct State {
    max_total: usize,
    max_per_ip: usize,
    queue_cap: usize,
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
    queue: VecDeque<Waiter>,
}

impl State {
    fn has_capacity(&self, ip: IpAddr) -> bool {
        self.total < self.max_total
            && self.per_ip.get(&ip).copied().unwrap_or(0) < self.max_per_ip
    }

    fn admit(&mut self, ip: IpAddr) {
        self.total += 1;
        *self.per_ip.entry(ip).or_insert(0) += 1;
    }
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn release(self: &Arc<Self>, ip: IpAddr) {
        let dispatch = {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
            if let Some(count) = state.per_ip.get_mut(&ip) {
                *count -= 1;
                if *count == 0 {
                    state.per_ip.remove(&ip);
                }
            }
            self.drain_queue(&mut state)
        };
        self.dispatch(dispatch);
    }

    /// Pop admissible waiters off the queue head. Strict FIFO: a head
    /// blocked on its per-IP cap blocks everything behind it.
    fn drain_queue(
        self: &Arc<Self>,
        state: &mut State,
    ) -> Vec<(oneshot::Sender<InFlightPermit>, InFlightPermit)> {
        let mut out = Vec::new();
        while let Some(front) = state.queue.front() {
            if front.tx.is_closed() {
                state.queue.pop_front();
                continue;
            }
            if !state.has_capacity(front.ip) {
                break;
            }
            if let Some(waiter) = state.queue.pop_front() {
                state.admit(waiter.ip);
                let permit = InFlightPermit {
                    shared: Arc::clone(self),
                    ip: waiter.ip,
                };
                out.push((waiter.tx, permit));
            }
        }
        out
    }

    fn dispatch(
        self: &Arc<Self>,
        waiters: Vec<(oneshot::Sender<InFlightPermit>, InFlightPermit)>,
    ) {
        for (tx, permit) in waiters {
            if tx.send(permit).is_err() {
                // The requester vanished between the closed check and the
                // send; the returned permit drops here and releases the
                // counters it just took.
            }
        }
    }
}

/// Proof that a request is admitted and counted in-flight.
///
/// Dropping the permit releases the global and per-IP counters and
/// dispatches queued waiters, regardless of how the request ended.
pub struct InFlightPermit {
    shared: Arc<Shared>,
    ip: IpAddr,
}

impl InFlightPermit {
    /// The source address this permit is accounted against.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl std::fmt::Debug for InFlightPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightPermit").field("ip", &self.ip).finish()
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.shared.release(self.ip);
    }
}

/// Bounds total and per-source-IP in-flight requests.
pub struct RequestLimiter {
    shared: Arc<Shared>,
}

impl RequestLimiter {
    /// Create a limiter with the given caps and queue size.
    pub fn new(max_total: usize, max_per_ip: usize, queue_cap: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    max_total,
                    max_per_ip,
                    queue_cap,
                    total: 0,
                    per_ip: HashMap::new(),
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// Replace the caps without disturbing in-flight accounting. Raised
    /// caps dispatch queued waiters immediately.
    pub fn reconfigure(&self, max_total: usize, max_per_ip: usize, queue_cap: usize) {
        let dispatch = {
            let mut state = self.shared.state.lock();
            state.max_total = max_total;
            state.max_per_ip = max_per_ip;
            state.queue_cap = queue_cap;
            self.shared.drain_queue(&mut state)
        };
        self.shared.dispatch(dispatch);
    }

    /// Admit, queue, or reject a request from `ip`.
    ///
    /// Resolves once admitted; queued callers wait their turn in arrival
    /// order. Abandoning the returned future while queued frees the
    /// queue slot on the next dispatch pass.
    pub async fn acquire(&self, ip: IpAddr) -> Result<InFlightPermit, QueueFull> {
        let rx = {
            let mut state = self.shared.state.lock();
            state.queue.retain(|w| !w.tx.is_closed());
            if state.queue.is_empty() && state.has_capacity(ip) {
                state.admit(ip);
                return Ok(InFlightPermit {
                    shared: Arc::clone(&self.shared),
                    ip,
                });
            }
            if state.queue.len() >= state.queue_cap {
                debug!(%ip, queued = state.queue.len(), "admission queue full");
                return Err(QueueFull);
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { ip, tx });
            rx
        };
        rx.await.map_err(|_| QueueFull)
    }

    /// Total requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().total
    }

    /// Requests currently in flight from `ip`.
    pub fn in_flight_for(&self, ip: IpAddr) -> usize {
        self.shared
            .state
            .lock()
            .per_ip
            .get(&ip)
            .copied()
            .unwrap_or(0)
    }

    /// Requests currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[tokio::test]
    async fn test_admits_within_caps() {
        let limiter = RequestLimiter::new(2, 2, 0);
        let p1 = limiter.acquire(ip(1)).await.unwrap();
        let p2 = limiter.acquire(ip(2)).await.unwrap();
        assert_eq!(limiter.in_flight(), 2);
        drop(p1);
        drop(p2);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_rejects_when_queue_full() {
        let limiter = RequestLimiter::new(1, 1, 0);
        let _p1 = limiter.acquire(ip(1)).await.unwrap();
        assert!(matches!(limiter.acquire(ip(2)).await, Err(QueueFull)));
    }

    #[tokio::test]
    async fn test_queued_request_dispatched_in_fifo_order() {
        let limiter = RequestLimiter::new(1, 1, 2);
        let p1 = limiter.acquire(ip(1)).await.unwrap();

        let mut second = task::spawn(limiter.acquire(ip(2)));
        assert_pending!(second.poll());
        let mut third = task::spawn(limiter.acquire(ip(3)));
        assert_pending!(third.poll());
        assert_eq!(limiter.queued(), 2);

        drop(p1);
        assert!(second.is_woken());
        let p2 = assert_ready!(second.poll()).unwrap();
        // Third is still waiting behind the cap.
        assert_pending!(third.poll());

        drop(p2);
        let p3 = assert_ready!(third.poll()).unwrap();
        assert_eq!(p3.ip(), ip(3));
    }

    #[tokio::test]
    async fn test_per_ip_cap_enforced() {
        let limiter = RequestLimiter::new(10, 1, 0);
        let _p1 = limiter.acquire(ip(1)).await.unwrap();
        assert!(matches!(limiter.acquire(ip(1)).await, Err(QueueFull)));
        // Other sources are unaffected.
        let _p2 = limiter.acquire(ip(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_releases_counters() {
        let limiter = RequestLimiter::new(4, 4, 0);
        let permit = limiter.acquire(ip(1)).await.unwrap();
        assert_eq!(limiter.in_flight(), 1);
        assert_eq!(limiter.in_flight_for(ip(1)), 1);

        // An abrupt client disconnect drops the permit mid-request.
        drop(permit);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.in_flight_for(ip(1)), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let limiter = RequestLimiter::new(1, 1, 2);
        let p1 = limiter.acquire(ip(1)).await.unwrap();

        let mut abandoned = task::spawn(limiter.acquire(ip(2)));
        assert_pending!(abandoned.poll());
        let mut survivor = task::spawn(limiter.acquire(ip(3)));
        assert_pending!(survivor.poll());
        drop(abandoned);

        drop(p1);
        // The abandoned head is discarded and the survivor admitted.
        let permit = assert_ready!(survivor.poll()).unwrap();
        assert_eq!(permit.ip(), ip(3));
        assert_eq!(limiter.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_new_arrivals_queue_behind_waiters() {
        let limiter = RequestLimiter::new(2, 1, 4);
        let p1 = limiter.acquire(ip(1)).await.unwrap();
        // Same-IP request hits the per-IP cap and queues, even though
        // total capacity remains.
        let mut queued = task::spawn(limiter.acquire(ip(1)));
        assert_pending!(queued.poll());

        // A different IP arriving later must not overtake the queue head.
        let mut later = task::spawn(limiter.acquire(ip(2)));
        assert_pending!(later.poll());

        drop(p1);
        let head = assert_ready!(queued.poll()).unwrap();
        let tail = assert_ready!(later.poll()).unwrap();
        assert_eq!(head.ip(), ip(1));
        assert_eq!(tail.ip(), ip(2));
    }

    #[tokio::test]
    async fn test_reconfigure_dispatches_waiters() {
        let limiter = RequestLimiter::new(1, 1, 2);
        let _p1 = limiter.acquire(ip(1)).await.unwrap();
        let mut queued = task::spawn(limiter.acquire(ip(2)));
        assert_pending!(queued.poll());

        limiter.reconfigure(2, 1, 2);
        let permit = assert_ready!(queued.poll()).unwrap();
        assert_eq!(permit.ip(), ip(2));
        assert_eq!(limiter.in_flight(), 2);
    }
}
