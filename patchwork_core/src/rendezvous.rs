//! Counted rendezvous box.
//!
//! An [`OwnerBox`] hands one piece of data per cycle from its owner to a
//! fixed set of registered users. Each user opens the box once and closes it
//! once; when the last close lands the box is drained, the registered
//! callback fires exactly once, and the owner may take the data back and
//! re-arm for the next cycle.
//!
//! ```text
//!  owner            user A          user B
//!    | arm(data)       |               |
//!    |---------------->| open          |
//!    |------------------------------->| open
//!    |                 | close         |
//!    |                 |               | close  -> AllClosed, callback
//!    | take()          |               |
//! ```
//!
//! Open count and close count are always set together by `arm`. Every
//! out-of-order call is rejected with a [`BoxError`], including a close that
//! arrives before the matching open.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Handle identifying one registered user of a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BoxUserId(pub u32);

impl std::fmt::Display for BoxUserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user{}", self.0)
    }
}

/// Ordering violations on a box.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoxError {
    #[error("box armed again before every user closed it")]
    AlreadyArmed,

    #[error("box is not armed")]
    NotArmed,

    #[error("{0} opened the box twice in one cycle")]
    AlreadyOpen(BoxUserId),

    #[error("{0} already closed the box this cycle")]
    AlreadyClosed(BoxUserId),

    #[error("{0} closed the box without opening it")]
    CloseWithoutOpen(BoxUserId),

    #[error("{0} is not registered with this box")]
    UnknownUser(BoxUserId),

    #[error("users cannot join or leave while the box is armed")]
    MembershipWhileArmed,

    #[error("box still has {0} outstanding closes")]
    NotDrained(usize),
}

/// Outcome of an operation that may complete the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxEvent {
    /// Some users have yet to close
    Pending { remaining: usize },
    /// Last close of cycle `cycle` landed
    AllClosed { cycle: u64 },
}

impl BoxEvent {
    pub fn is_all_closed(&self) -> bool {
        matches!(self, BoxEvent::AllClosed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserState {
    Idle,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disarmed,
    Armed,
    Drained,
}

type Callback = Box<dyn FnMut(u64) + Send>;

/// Owner side of a counted rendezvous.
pub struct OwnerBox<T> {
    data: Option<T>,
    users: BTreeMap<BoxUserId, UserState>,
    next_user: u32,
    open_count: usize,
    close_count: usize,
    phase: Phase,
    cycle: u64,
    on_all_closed: Option<Callback>,
}

impl<T> Default for OwnerBox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OwnerBox<T> {
    pub fn new() -> Self {
        Self {
            data: None,
            users: BTreeMap::new(),
            next_user: 0,
            open_count: 0,
            close_count: 0,
            phase: Phase::Disarmed,
            cycle: 0,
            on_all_closed: None,
        }
    }

    /// Installs the "all data consumed" callback. It receives the cycle number.
    pub fn set_callback(&mut self, callback: impl FnMut(u64) + Send + 'static) {
        self.on_all_closed = Some(Box::new(callback));
    }

    /// Adds a user for subsequent cycles.
    pub fn register(&mut self) -> Result<BoxUserId, BoxError> {
        if self.phase == Phase::Armed {
            return Err(BoxError::MembershipWhileArmed);
        }
        let id = BoxUserId(self.next_user);
        self.next_user += 1;
        self.users.insert(id, UserState::Idle);
        Ok(id)
    }

    pub fn unregister(&mut self, user: BoxUserId) -> Result<(), BoxError> {
        if self.phase == Phase::Armed {
            return Err(BoxError::MembershipWhileArmed);
        }
        self.users
            .remove(&user)
            .map(|_| ())
            .ok_or(BoxError::UnknownUser(user))
    }

    /// Publishes `data` for a new cycle.
    ///
    /// Both counters are set to the number of registered users. With no users
    /// the cycle completes immediately.
    pub fn arm(&mut self, data: T) -> Result<BoxEvent, BoxError> {
        if self.phase == Phase::Armed {
            return Err(BoxError::AlreadyArmed);
        }
        self.data = Some(data);
        self.cycle += 1;
        self.open_count = self.users.len();
        self.close_count = self.users.len();
        for state in self.users.values_mut() {
            *state = UserState::Idle;
        }
        self.phase = Phase::Armed;

        if self.close_count == 0 {
            Ok(self.drain())
        } else {
            Ok(BoxEvent::Pending {
                remaining: self.close_count,
            })
        }
    }

    /// Read access for `user`.
    pub fn open(&mut self, user: BoxUserId) -> Result<&T, BoxError> {
        self.mark_open(user)?;
        self.data.as_ref().ok_or(BoxError::NotArmed)
    }

    /// Write access for `user`, used by force contributors.
    pub fn open_mut(&mut self, user: BoxUserId) -> Result<&mut T, BoxError> {
        self.mark_open(user)?;
        self.data.as_mut().ok_or(BoxError::NotArmed)
    }

    /// Releases `user`'s reference for this cycle.
    pub fn close(&mut self, user: BoxUserId) -> Result<BoxEvent, BoxError> {
        let state = self
            .users
            .get_mut(&user)
            .ok_or(BoxError::UnknownUser(user))?;
        if self.phase != Phase::Armed {
            return Err(BoxError::NotArmed);
        }
        let current = *state;
        match current {
            UserState::Idle => return Err(BoxError::CloseWithoutOpen(user)),
            UserState::Closed => return Err(BoxError::AlreadyClosed(user)),
            UserState::Open => *state = UserState::Closed,
        }
        self.close_count -= 1;
        if self.close_count == 0 {
            Ok(self.drain())
        } else {
            Ok(BoxEvent::Pending {
                remaining: self.close_count,
            })
        }
    }

    /// Takes the data back after the cycle drained.
    pub fn take(&mut self) -> Result<T, BoxError> {
        match self.phase {
            Phase::Armed => Err(BoxError::NotDrained(self.close_count)),
            Phase::Disarmed => Err(BoxError::NotArmed),
            Phase::Drained => {
                self.phase = Phase::Disarmed;
                self.data.take().ok_or(BoxError::NotArmed)
            }
        }
    }

    /// Whether `user` currently holds an open reference.
    pub fn is_open_by(&self, user: BoxUserId) -> bool {
        self.phase == Phase::Armed && self.users.get(&user) == Some(&UserState::Open)
    }

    /// Whether `user` still owes an open or close this cycle.
    pub fn is_pending_for(&self, user: BoxUserId) -> bool {
        self.phase == Phase::Armed
            && matches!(self.users.get(&user), Some(UserState::Idle | UserState::Open))
    }

    pub fn is_armed(&self) -> bool {
        self.phase == Phase::Armed
    }

    pub fn is_drained(&self) -> bool {
        self.phase == Phase::Drained
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    pub fn open_count(&self) -> usize {
        self.open_count
    }

    pub fn close_count(&self) -> usize {
        self.close_count
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    fn mark_open(&mut self, user: BoxUserId) -> Result<(), BoxError> {
        let state = self
            .users
            .get_mut(&user)
            .ok_or(BoxError::UnknownUser(user))?;
        if self.phase != Phase::Armed {
            return Err(BoxError::NotArmed);
        }
        let current = *state;
        match current {
            UserState::Open => Err(BoxError::AlreadyOpen(user)),
            UserState::Closed => Err(BoxError::AlreadyClosed(user)),
            UserState::Idle => {
                *state = UserState::Open;
                self.open_count -= 1;
                Ok(())
            }
        }
    }

    fn drain(&mut self) -> BoxEvent {
        self.phase = Phase::Drained;
        if let Some(callback) = self.on_all_closed.as_mut() {
            callback(self.cycle);
        }
        BoxEvent::AllClosed { cycle: self.cycle }
    }
}

impl<T> std::fmt::Debug for OwnerBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerBox")
            .field("phase", &self.phase)
            .field("users", &self.users.len())
            .field("open_count", &self.open_count)
            .field("close_count", &self.close_count)
            .field("cycle", &self.cycle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn counting_box() -> (OwnerBox<Vec<u32>>, Arc<AtomicU64>) {
        let fired = Arc::new(AtomicU64::new(0));
        let mut b = OwnerBox::new();
        let counter = Arc::clone(&fired);
        b.set_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (b, fired)
    }

    #[test]
    fn test_cycle_completes_after_all_closes() {
        let (mut b, fired) = counting_box();
        let u1 = b.register().unwrap();
        let u2 = b.register().unwrap();

        assert_eq!(b.arm(vec![1, 2, 3]).unwrap(), BoxEvent::Pending { remaining: 2 });
        assert_eq!(b.open(u1).unwrap(), &vec![1, 2, 3]);
        b.open_mut(u2).unwrap().push(4);
        assert_eq!(b.open_count(), 0);

        assert_eq!(b.close(u2).unwrap(), BoxEvent::Pending { remaining: 1 });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(b.close(u1).unwrap(), BoxEvent::AllClosed { cycle: 1 });
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert_eq!(b.take().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_close_before_open_rejected() {
        let (mut b, fired) = counting_box();
        let u = b.register().unwrap();
        b.arm(vec![]).unwrap();
        assert_eq!(b.close(u), Err(BoxError::CloseWithoutOpen(u)));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_double_open_and_double_close_rejected() {
        let (mut b, fired) = counting_box();
        let u1 = b.register().unwrap();
        let u2 = b.register().unwrap();
        b.arm(vec![]).unwrap();
        b.open(u1).unwrap();
        assert_eq!(b.open(u1).unwrap_err(), BoxError::AlreadyOpen(u1));
        b.close(u1).unwrap();
        assert_eq!(b.close(u1), Err(BoxError::AlreadyClosed(u1)));
        assert_eq!(b.open(u1).unwrap_err(), BoxError::AlreadyClosed(u1));
        b.open(u2).unwrap();
        b.close(u2).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rearm_while_armed_rejected() {
        let (mut b, _) = counting_box();
        let u = b.register().unwrap();
        b.arm(vec![1]).unwrap();
        assert_eq!(b.arm(vec![2]), Err(BoxError::AlreadyArmed));
        assert_eq!(b.take(), Err(BoxError::NotDrained(1)));
        assert_eq!(b.register(), Err(BoxError::MembershipWhileArmed));
        b.open(u).unwrap();
        b.close(u).unwrap();
        assert!(b.arm(vec![2]).is_ok());
    }

    #[test]
    fn test_zero_users_completes_on_arm() {
        let (mut b, fired) = counting_box();
        assert_eq!(b.arm(vec![9]).unwrap(), BoxEvent::AllClosed { cycle: 1 });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(b.take().unwrap(), vec![9]);
    }

    #[test]
    fn test_unknown_user() {
        let (mut b, _) = counting_box();
        let u = b.register().unwrap();
        b.unregister(u).unwrap();
        assert_eq!(b.unregister(u), Err(BoxError::UnknownUser(u)));
        assert_eq!(b.open(u).unwrap_err(), BoxError::UnknownUser(u));

        // Drained right away with no users left; still reported as unknown
        assert!(b.arm(vec![]).unwrap().is_all_closed());
        assert_eq!(b.open(u).unwrap_err(), BoxError::UnknownUser(u));
        assert_eq!(b.close(u), Err(BoxError::UnknownUser(u)));
    }

    #[test]
    fn test_unknown_user_while_armed() {
        let (mut b, _) = counting_box();
        let gone = b.register().unwrap();
        let stays = b.register().unwrap();
        b.unregister(gone).unwrap();
        assert_eq!(b.arm(vec![]).unwrap(), BoxEvent::Pending { remaining: 1 });
        assert_eq!(b.open(gone).unwrap_err(), BoxError::UnknownUser(gone));
        assert_eq!(b.close(gone), Err(BoxError::UnknownUser(gone)));
        b.open(stays).unwrap();
        assert!(b.close(stays).unwrap().is_all_closed());
    }

    proptest! {
        #[test]
        fn prop_callback_fires_once_per_cycle(
            keys in proptest::collection::vec(any::<u32>(), 0..10),
            cycles in 1u64..5,
        ) {
            let (mut b, fired) = counting_box();
            let users: Vec<BoxUserId> = keys.iter().map(|_| b.register().unwrap()).collect();
            let mut order: Vec<usize> = (0..users.len()).collect();
            order.sort_by_key(|&i| keys[i]);

            for cycle in 1..=cycles {
                let armed = b.arm(Vec::new()).unwrap();
                if users.is_empty() {
                    prop_assert_eq!(armed, BoxEvent::AllClosed { cycle });
                }
                for &i in &order {
                    b.open(users[i]).unwrap();
                }
                for (n, &i) in order.iter().enumerate() {
                    let before = fired.load(Ordering::SeqCst);
                    let event = b.close(users[i]).unwrap();
                    if n + 1 < users.len() {
                        prop_assert!(!event.is_all_closed());
                        prop_assert_eq!(fired.load(Ordering::SeqCst), before);
                    } else {
                        prop_assert_eq!(event, BoxEvent::AllClosed { cycle });
                        prop_assert_eq!(fired.load(Ordering::SeqCst), before + 1);
                    }
                }
                prop_assert_eq!(fired.load(Ordering::SeqCst), cycle);
                b.take().unwrap();
            }
        }
    }
}
