//! Path reservation scheduler.
//!
//! Lets many entries be materialized concurrently while guaranteeing that
//! no two in-flight operations touch the same path, and that no operation
//! replaces a directory while another operation is working underneath it.
//!
//! Each reserved path gets an *exclusive* slot appended to that path's
//! queue; each ancestor directory of a reserved path gets a *shared* slot
//! (consecutive shared reservations collapse into one slot, so any number
//! of extractions can occupy a directory at once — they only need the
//! directory itself to stay put).  A handler may run once it is at the
//! head of every queue it appears in.  Queue order is reservation-call
//! order, so entries that collide are processed in archive order.
//!
//! All queue state lives behind one mutex; reservation traffic is a few
//! map operations per entry and nowhere near the filesystem cost it
//! guards.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::paths;
use crate::util::lock;

/// Queue key used when the scheduler is degraded to a single global queue.
const SERIAL_KEY: &str = "\0serial";

#[derive(Debug)]
enum Slot {
    Exclusive(u64),
    Shared(Vec<u64>),
}

#[derive(Debug)]
struct Registration {
    keys: Vec<String>,
    dirs: Vec<String>,
    waiter: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<Slot>>,
    registrations: HashMap<u64, Registration>,
    next_id: u64,
}

/// The scheduler.  One instance serves one extraction; it is cheap enough
/// that nothing is gained by sharing it wider.
#[derive(Debug)]
pub struct PathReservations {
    state: Mutex<State>,
    serial: bool,
    win32: bool,
}

impl PathReservations {
    /// `serial` collapses every reservation onto a single queue — the
    /// degraded mode for filesystems where path-level parallelism is
    /// unsafe.  `win32` selects Windows path canonicalization.
    pub fn new(serial: bool, win32: bool) -> Self {
        Self {
            state: Mutex::new(State::default()),
            serial,
            win32,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Append queue slots for `targets` and their ancestors.  Slots are
    /// appended before this call returns, so the caller's call order fixes
    /// the service order for conflicting reservations.
    pub fn reserve(self: &Arc<Self>, targets: &[&Path]) -> PendingReservation {
        let (keys, dirs) = self.keys_for(targets);
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        for key in &keys {
            state
                .queues
                .entry(key.clone())
                .or_default()
                .push_back(Slot::Exclusive(id));
        }
        for dir in &dirs {
            let queue = state.queues.entry(dir.clone()).or_default();
            match queue.back_mut() {
                Some(Slot::Shared(ids)) => ids.push(id),
                _ => queue.push_back(Slot::Shared(vec![id])),
            }
        }
        state.registrations.insert(
            id,
            Registration {
                keys: keys.clone(),
                dirs: dirs.clone(),
                waiter: None,
            },
        );

        PendingReservation {
            scheduler: Arc::clone(self),
            id,
            keys,
            dirs,
            consumed: false,
        }
    }

    fn keys_for(&self, targets: &[&Path]) -> (Vec<String>, Vec<String>) {
        if self.serial {
            return (vec![SERIAL_KEY.to_owned()], Vec::new());
        }
        let mut keys: Vec<String> = Vec::with_capacity(targets.len());
        for target in targets {
            let key = paths::cache_key(&target.to_string_lossy(), self.win32);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        let mut dirs: Vec<String> = Vec::new();
        for key in &keys {
            for dir in paths::ancestors(key) {
                if !dirs.contains(&dir) && !keys.contains(&dir) {
                    dirs.push(dir);
                }
            }
        }
        (keys, dirs)
    }

    fn eligible(state: &State, id: u64, keys: &[String], dirs: &[String]) -> bool {
        keys.iter().all(|key| {
            matches!(
                state.queues.get(key).and_then(VecDeque::front),
                Some(Slot::Exclusive(head)) if *head == id
            )
        }) && dirs.iter().all(|dir| {
            matches!(
                state.queues.get(dir).and_then(VecDeque::front),
                Some(Slot::Shared(ids)) if ids.contains(&id)
            )
        })
    }

    /// Remove `id` from every queue it appears in and start whatever that
    /// makes eligible.
    fn release(&self, id: u64, keys: &[String], dirs: &[String]) {
        let mut state = self.lock();
        state.registrations.remove(&id);

        let mut touched: Vec<&String> = Vec::new();
        for key in keys.iter().chain(dirs) {
            let Some(queue) = state.queues.get_mut(key) else {
                continue;
            };
            queue.retain_mut(|slot| match slot {
                Slot::Exclusive(held) => *held != id,
                Slot::Shared(ids) => {
                    ids.retain(|held| *held != id);
                    !ids.is_empty()
                }
            });
            if queue.is_empty() {
                state.queues.remove(key);
            } else {
                touched.push(key);
            }
        }

        let mut ready: Vec<u64> = Vec::new();
        for key in touched {
            let candidates: Vec<u64> = match state.queues.get(key).and_then(VecDeque::front) {
                Some(Slot::Exclusive(head)) => vec![*head],
                Some(Slot::Shared(ids)) => ids.clone(),
                None => Vec::new(),
            };
            for candidate in candidates {
                if ready.contains(&candidate) {
                    continue;
                }
                let Some(registration) = state.registrations.get(&candidate) else {
                    continue;
                };
                if registration.waiter.is_some()
                    && Self::eligible(&state, candidate, &registration.keys, &registration.dirs)
                {
                    ready.push(candidate);
                }
            }
        }

        for candidate in ready {
            if let Some(registration) = state.registrations.get_mut(&candidate) {
                if let Some(waiter) = registration.waiter.take() {
                    let _ = waiter.send(());
                }
            }
        }
    }
}

/// A reservation whose slots are queued but whose handler has not started.
#[derive(Debug)]
pub struct PendingReservation {
    scheduler: Arc<PathReservations>,
    id: u64,
    keys: Vec<String>,
    dirs: Vec<String>,
    consumed: bool,
}

impl PendingReservation {
    /// Wait until every reserved queue has this reservation at its head.
    pub async fn acquired(mut self) -> ReservationGuard {
        let receiver = {
            let mut state = self.scheduler.lock();
            if PathReservations::eligible(&state, self.id, &self.keys, &self.dirs) {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                if let Some(registration) = state.registrations.get_mut(&self.id) {
                    registration.waiter = Some(tx);
                }
                Some(rx)
            }
        };
        if let Some(rx) = receiver {
            let _ = rx.await;
        }
        self.consumed = true;
        ReservationGuard {
            scheduler: Arc::clone(&self.scheduler),
            id: self.id,
            keys: mem::take(&mut self.keys),
            dirs: mem::take(&mut self.dirs),
            released: false,
        }
    }
}

impl Drop for PendingReservation {
    fn drop(&mut self) {
        if !self.consumed {
            self.scheduler.release(self.id, &self.keys, &self.dirs);
        }
    }
}

/// Held while a handler runs; releasing it (explicitly or on drop) frees
/// the reserved paths exactly once.
#[derive(Debug)]
pub struct ReservationGuard {
    scheduler: Arc<PathReservations>,
    id: u64,
    keys: Vec<String>,
    dirs: Vec<String>,
    released: bool,
}

impl ReservationGuard {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.scheduler.release(self.id, &self.keys, &self.dirs);
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn scheduler() -> Arc<PathReservations> {
        Arc::new(PathReservations::new(false, false))
    }

    #[tokio::test]
    async fn disjoint_paths_run_concurrently() {
        let res = scheduler();
        let a = res.reserve(&[Path::new("/x/a")]).acquired().await;
        let b = res.reserve(&[Path::new("/x/b")]).acquired().await;
        a.release();
        b.release();
    }

    #[tokio::test]
    async fn same_path_is_fifo() {
        let res = scheduler();
        let first = res.reserve(&[Path::new("/x/a")]);
        let second = res.reserve(&[Path::new("/x/a")]);
        let guard = first.acquired().await;

        let second = tokio::spawn(second.acquired());
        tokio::task::yield_now().await;
        assert!(!second.is_finished());
        guard.release();
        second.await.unwrap().release();
    }

    #[tokio::test]
    async fn equivalent_spellings_conflict() {
        let res = scheduler();
        let guard = res.reserve(&[Path::new("/x/File")]).acquired().await;
        let other = tokio::spawn(res.reserve(&[Path::new("/x/file/")]).acquired());
        tokio::task::yield_now().await;
        assert!(!other.is_finished());
        guard.release();
        other.await.unwrap().release();
    }

    #[tokio::test]
    async fn ancestor_is_blocked_by_descendant() {
        let res = scheduler();
        let child = res.reserve(&[Path::new("/x/a/b")]).acquired().await;

        let parent = tokio::spawn(res.reserve(&[Path::new("/x/a")]).acquired());
        tokio::task::yield_now().await;
        assert!(!parent.is_finished());

        child.release();
        parent.await.unwrap().release();
    }

    #[tokio::test]
    async fn shared_directory_admits_many() {
        let res = scheduler();
        let a = res.reserve(&[Path::new("/dir/a")]).acquired().await;
        let b = res.reserve(&[Path::new("/dir/b")]).acquired().await;
        let c = res.reserve(&[Path::new("/dir/c")]).acquired().await;
        c.release();
        a.release();
        b.release();
    }

    #[tokio::test]
    async fn multi_path_reservation_waits_for_both() {
        let res = scheduler();
        let target = res.reserve(&[Path::new("/a")]).acquired().await;

        // a hard link reserves both its own path and its target
        let link = res.reserve(&[Path::new("/b"), Path::new("/a")]);
        let link = tokio::spawn(link.acquired());
        tokio::task::yield_now().await;
        assert!(!link.is_finished());

        target.release();
        link.await.unwrap().release();
    }

    #[tokio::test]
    async fn dropped_pending_reservation_unblocks_queue() {
        let res = scheduler();
        let first = res.reserve(&[Path::new("/x")]).acquired().await;
        let abandoned = res.reserve(&[Path::new("/x")]);
        let third = res.reserve(&[Path::new("/x")]);

        drop(abandoned);
        first.release();
        timeout(Duration::from_secs(1), third.acquired())
            .await
            .expect("third reservation should start")
            .release();
    }

    #[tokio::test]
    async fn serial_mode_admits_one_at_a_time() {
        let res = Arc::new(PathReservations::new(true, false));
        let first = res.reserve(&[Path::new("/x/a")]).acquired().await;
        let second = tokio::spawn(res.reserve(&[Path::new("/y/b")]).acquired());
        tokio::task::yield_now().await;
        assert!(!second.is_finished());
        first.release();
        second.await.unwrap().release();
    }

    #[tokio::test]
    async fn fifo_order_is_observed() {
        let res = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = res.reserve(&[Path::new("/x")]);
        let second = res.reserve(&[Path::new("/x")]);
        let third = res.reserve(&[Path::new("/x")]);

        let mut tasks = Vec::new();
        for (label, pending) in [(1u32, first), (2, second), (3, third)] {
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let guard = pending.acquired().await;
                order.lock().unwrap().push(label);
                guard.release();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }
}
