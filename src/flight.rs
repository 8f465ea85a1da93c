use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Collapses overlapping requests for the same job into one running job plus
/// at most one trailing re-run.
#[derive(Debug, Default)]
pub struct SingleFlight {
    state: Mutex<FlightState>,
    settled: Condvar,
}

#[derive(Debug, Default)]
struct FlightState {
    running: bool,
    owed: bool,
    waiting: usize,
    settled_epoch: u64,
    runs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader { passes: u64 },
    Follower,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run<F: FnMut()>(&self, mut job: F) -> FlightRole {
        let mut state = self.lock();
        if state.running {
            state.owed = true;
            state.waiting += 1;
            let ticket = state.settled_epoch;
            while state.settled_epoch == ticket {
                state = self
                    .settled
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.waiting -= 1;
            return FlightRole::Follower;
        }
        state.running = true;
        drop(state);

        let mut passes = 0u64;
        loop {
            job();
            passes += 1;
            let mut state = self.lock();
            state.runs += 1;
            if state.owed {
                state.owed = false;
                continue;
            }
            state.running = false;
            state.settled_epoch += 1;
            self.settled.notify_all();
            break;
        }
        FlightRole::Leader { passes }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_owed(&self) -> bool {
        self.lock().owed
    }

    pub fn waiting(&self) -> usize {
        self.lock().waiting
    }

    pub fn runs(&self) -> u64 {
        self.lock().runs
    }

    fn lock(&self) -> MutexGuard<'_, FlightState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn sequential_calls_each_run_once() {
        let flight = SingleFlight::new();
        let mut count = 0;
        assert_eq!(flight.run(|| count += 1), FlightRole::Leader { passes: 1 });
        assert_eq!(flight.run(|| count += 1), FlightRole::Leader { passes: 1 });
        assert_eq!(count, 2);
        assert_eq!(flight.runs(), 2);
    }

    #[test]
    fn burst_during_flight_collapses_into_one_trailing_pass() {
        let flight = Arc::new(SingleFlight::new());
        let executed = Arc::new(AtomicU64::new(0));
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let leader = {
            let flight = Arc::clone(&flight);
            let executed = Arc::clone(&executed);
            thread::spawn(move || {
                flight.run(|| {
                    let pass = executed.fetch_add(1, Ordering::SeqCst);
                    if pass == 0 {
                        started_tx.send(()).expect("signal start");
                        release_rx.recv().expect("await release");
                    }
                })
            })
        };
        started_rx.recv().expect("leader started");

        let followers: Vec<_> = (0..3)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let executed = Arc::clone(&executed);
                thread::spawn(move || {
                    flight.run(|| {
                        executed.fetch_add(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        wait_until(|| flight.waiting() == 3);
        assert!(flight.is_owed());
        release_tx.send(()).expect("release leader");

        assert_eq!(
            leader.join().expect("leader thread"),
            FlightRole::Leader { passes: 2 }
        );
        for follower in followers {
            assert_eq!(follower.join().expect("follower"), FlightRole::Follower);
        }
        assert_eq!(executed.load(Ordering::SeqCst), 2);
        assert!(!flight.is_running());
        assert!(!flight.is_owed());
        assert_eq!(flight.waiting(), 0);
    }
}
