//! Ranked point-to-point transport.
//!
//! The world is a fixed set of ranks, one OS thread each, wired with one
//! in-order channel per `(dst, tag)` route. Payloads are encoded to bytes on
//! send and decoded on receive, so everything crossing a rank boundary goes
//! through the real wire format. Each endpoint owns a Lamport clock: sends
//! stamp the envelope and then advance the clock, receives merge it with
//! `max(local, envelope) + 1`.
//!
//! Delivery is reliable and FIFO per `(src, dst, tag)`; envelopes from
//! different sources interleave arbitrarily. There are no retries and no
//! timeouts: the only way out of a blocked receive is a message or a world
//! abort.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CommError;
use crate::logbook::Logbook;
use crate::storage::Rank;

/// How often blocked receives and barrier waits check the abort flag.
const POLL: Duration = Duration::from_millis(25);

/// Message classes. The numeric codes appear in logs and mirror the wire
/// contract: 0 bootstrap, 1 control, 10 reply-to-application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Init,
    Ctl,
    Gather,
    Reply,
}

pub const TAGS: [Tag; 4] = [Tag::Init, Tag::Ctl, Tag::Gather, Tag::Reply];

impl Tag {
    pub fn code(self) -> u8 {
        match self {
            Tag::Init => 0,
            Tag::Ctl => 1,
            Tag::Gather => 5,
            Tag::Reply => 10,
        }
    }
}

/// Wire form of a message: routing header, logical clock, payload bytes.
#[derive(Debug, Clone)]
struct Frame {
    src: Rank,
    dst: Rank,
    clock: u64,
    data: Vec<u8>,
}

/// A decoded message as handed to the layers above.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub src: Rank,
    pub dst: Rank,
    pub clock: u64,
    pub data: T,
}

/// Abort-aware barrier. `std::sync::Barrier` would deadlock a world where
/// one rank died; this one polls the abort flag while parked.
pub struct SyncPoint {
    size: usize,
    state: Mutex<(usize, u64)>,
    cvar: Condvar,
}

impl SyncPoint {
    pub fn new(size: usize) -> Self {
        SyncPoint { size, state: Mutex::new((0, 0)), cvar: Condvar::new() }
    }

    pub fn wait(&self, aborted: &AtomicBool) -> Result<(), CommError> {
        let mut state = self.state.lock().unwrap();
        let generation = state.1;
        state.0 += 1;
        if state.0 == self.size {
            state.0 = 0;
            state.1 += 1;
            self.cvar.notify_all();
            return Ok(());
        }
        while state.1 == generation {
            if aborted.load(Ordering::SeqCst) {
                state.0 -= 1;
                return Err(CommError::Aborted);
            }
            let (next, _) = self.cvar.wait_timeout(state, POLL).unwrap();
            state = next;
        }
        Ok(())
    }
}

/// Handle kept by the launcher: world-wide flags outliving the endpoints.
#[derive(Clone)]
pub struct WorldHandle {
    aborted: Arc<AtomicBool>,
}

impl WorldHandle {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Build a world of `n` ranks. Each returned endpoint is meant to move into
/// its own thread; the handle stays with the launcher.
pub fn world(n: usize) -> (Vec<Endpoint>, WorldHandle) {
    let aborted = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(SyncPoint::new(n));

    let mut senders: Vec<HashMap<Tag, Sender<Frame>>> = Vec::with_capacity(n);
    let mut receivers: Vec<HashMap<Tag, Receiver<Frame>>> = Vec::with_capacity(n);
    for _ in 0..n {
        let mut tx_map = HashMap::new();
        let mut rx_map = HashMap::new();
        for tag in TAGS {
            let (tx, rx) = mpsc::channel();
            tx_map.insert(tag, tx);
            rx_map.insert(tag, rx);
        }
        senders.push(tx_map);
        receivers.push(rx_map);
    }

    let endpoints = receivers
        .into_iter()
        .enumerate()
        .map(|(rank, rx)| Endpoint {
            rank,
            world_size: n,
            clock: 0,
            senders: senders.clone(),
            rx,
            stash: TAGS.iter().map(|&t| (t, VecDeque::new())).collect(),
            barrier: barrier.clone(),
            aborted: aborted.clone(),
            logbook: Logbook::sink(rank),
        })
        .collect();

    (endpoints, WorldHandle { aborted })
}

/// One rank's connection to the world.
pub struct Endpoint {
    rank: Rank,
    world_size: usize,
    clock: u64,
    senders: Vec<HashMap<Tag, Sender<Frame>>>,
    rx: HashMap<Tag, Receiver<Frame>>,
    stash: HashMap<Tag, VecDeque<Frame>>,
    barrier: Arc<SyncPoint>,
    aborted: Arc<AtomicBool>,
    logbook: Logbook,
}

impl Endpoint {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn attach_logbook(&mut self, logbook: Logbook) {
        self.logbook = logbook;
    }

    /// One logbook line at the current clock.
    pub fn note(&mut self, msg: &str) {
        self.logbook.line(self.clock, msg);
    }

    /// Non-blocking handoff: encode, stamp the clock, advance it.
    pub fn send<T: Serialize + Debug>(
        &mut self,
        data: &T,
        dst: Rank,
        tag: Tag,
    ) -> Result<(), CommError> {
        let frame = Frame {
            src: self.rank,
            dst,
            clock: self.clock,
            data: bincode::serialize(data)?,
        };
        let sent = self.senders[dst][&tag].send(frame);
        self.clock += 1;
        self.logbook.line(
            self.clock,
            &format!("send: {:?} -> N{} on tag {}", data, dst, tag.code()),
        );
        match sent {
            Ok(()) => Ok(()),
            // a receiver that is already gone only matters in a live world
            Err(_) if self.aborted.load(Ordering::SeqCst) => Ok(()),
            Err(_) => Err(CommError::Closed(dst)),
        }
    }

    /// Blocking receive. `src = None` accepts any source; a src filter holds
    /// non-matching envelopes back in arrival order for later receives.
    pub fn recv<T: DeserializeOwned + Debug>(
        &mut self,
        src: Option<Rank>,
        tag: Tag,
    ) -> Result<Envelope<T>, CommError> {
        let frame = self.recv_frame(src, tag)?;
        self.clock = self.clock.max(frame.clock) + 1;
        let data: T = bincode::deserialize(&frame.data)?;
        self.logbook.line(
            self.clock,
            &format!("received: {:?} <- N{} on tag {}", data, frame.src, tag.code()),
        );
        Ok(Envelope { src: frame.src, dst: frame.dst, clock: frame.clock, data })
    }

    fn recv_frame(&mut self, src: Option<Rank>, tag: Tag) -> Result<Frame, CommError> {
        let stash = self.stash.get_mut(&tag).expect("tag is wired");
        match src {
            None => {
                if let Some(frame) = stash.pop_front() {
                    return Ok(frame);
                }
            }
            Some(want) => {
                if let Some(pos) = stash.iter().position(|f| f.src == want) {
                    return Ok(stash.remove(pos).expect("position is valid"));
                }
            }
        }
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return Err(CommError::Aborted);
            }
            match self.rx[&tag].recv_timeout(POLL) {
                Ok(frame) => {
                    if src.map_or(true, |want| frame.src == want) {
                        return Ok(frame);
                    }
                    self.stash.get_mut(&tag).expect("tag is wired").push_back(frame);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Closed(self.rank));
                }
            }
        }
    }

    /// Whole-world barrier.
    pub fn barrier(&self) -> Result<(), CommError> {
        self.barrier.wait(&self.aborted)
    }

    /// Poison the world: every blocked receive and barrier wait unblocks
    /// with `CommError::Aborted` within one poll interval.
    pub fn abort_world(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// A named slice of the world (the application partition), with its own
/// barrier and an allgather built from point-to-point envelopes.
#[derive(Clone)]
pub struct SubGroup {
    members: Vec<Rank>,
    barrier: Arc<SyncPoint>,
    aborted: Arc<AtomicBool>,
}

impl SubGroup {
    /// Split `members` out of the world. Members must be world ranks.
    pub fn new(members: Vec<Rank>, handle: &WorldHandle) -> Self {
        let barrier = Arc::new(SyncPoint::new(members.len()));
        SubGroup { members, barrier, aborted: handle.aborted.clone() }
    }

    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Position of a world rank inside the group.
    pub fn position(&self, rank: Rank) -> Option<usize> {
        self.members.iter().position(|&m| m == rank)
    }

    pub fn leader(&self) -> Rank {
        self.members[0]
    }

    pub fn barrier(&self) -> Result<(), CommError> {
        self.barrier.wait(&self.aborted)
    }

    /// Everyone contributes one item; everyone gets all items in member
    /// order. Runs entirely over the gather tag.
    pub fn allgather<T: Serialize + DeserializeOwned + Debug>(
        &self,
        ep: &mut Endpoint,
        item: &T,
    ) -> Result<Vec<T>, CommError> {
        for &m in &self.members {
            ep.send(item, m, Tag::Gather)?;
        }
        let mut gathered = Vec::with_capacity(self.members.len());
        for &m in &self.members {
            let env: Envelope<T> = ep.recv(Some(m), Tag::Gather)?;
            gathered.push(env.data);
        }
        Ok(gathered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn send_stamps_then_advances_and_recv_merges() {
        let (mut eps, _handle) = world(2);
        let mut b = eps.pop().expect("rank 1");
        let mut a = eps.pop().expect("rank 0");

        a.send(&41u64, 1, Tag::Ctl).expect("send");
        assert_eq!(a.clock(), 1);

        b.clock = 10;
        let env: Envelope<u64> = b.recv(None, Tag::Ctl).expect("recv");
        assert_eq!(env.data, 41);
        assert_eq!(env.clock, 0, "envelope carries the clock at send time");
        assert_eq!(b.clock(), 11, "max(10, 0) + 1");

        b.send(&1u64, 0, Tag::Ctl).expect("send back");
        let env: Envelope<u64> = a.recv(None, Tag::Ctl).expect("recv");
        assert_eq!(a.clock(), env.clock.max(1) + 1);
    }

    #[test]
    fn src_filtered_recv_stashes_other_sources_in_order() {
        let (mut eps, _handle) = world(3);
        let mut c = eps.pop().expect("rank 2");
        let mut b = eps.pop().expect("rank 1");
        let mut a = eps.pop().expect("rank 0");

        b.send(&"from-1", 2, Tag::Gather).expect("send");
        a.send(&"first", 2, Tag::Gather).expect("send");
        a.send(&"second", 2, Tag::Gather).expect("send");

        let env: Envelope<String> = c.recv(Some(0), Tag::Gather).expect("recv");
        assert_eq!(env.data, "first");
        // the stashed rank-1 frame is still deliverable, order preserved
        let env: Envelope<String> = c.recv(Some(1), Tag::Gather).expect("recv");
        assert_eq!(env.data, "from-1");
        let env: Envelope<String> = c.recv(None, Tag::Gather).expect("recv");
        assert_eq!(env.data, "second");
    }

    #[test]
    fn abort_unblocks_receives() {
        let (mut eps, handle) = world(2);
        let mut a = eps.remove(0);
        a.abort_world();
        let err = a.recv::<u64>(None, Tag::Ctl).expect_err("aborted");
        assert!(matches!(err, CommError::Aborted));
        assert!(handle.is_aborted());
    }

    #[test]
    fn allgather_orders_items_by_member_rank() {
        let (eps, handle) = world(4);
        let group = SubGroup::new(vec![2, 3], &handle);
        let mut threads = Vec::new();
        for mut ep in eps.into_iter().skip(2) {
            let group = group.clone();
            threads.push(std::thread::spawn(move || {
                let mine = ep.rank() as u64;
                group.allgather(&mut ep, &mine).expect("allgather")
            }));
        }
        for t in threads {
            assert_eq!(t.join().expect("join"), vec![2, 3]);
        }
    }

    #[test]
    fn subgroup_barrier_releases_all_members() {
        let (eps, handle) = world(2);
        let group = SubGroup::new(vec![0, 1], &handle);
        let mut threads = Vec::new();
        for ep in eps {
            let group = group.clone();
            threads.push(std::thread::spawn(move || {
                group.barrier().expect("barrier");
                drop(ep);
            }));
        }
        for t in threads {
            t.join().expect("join");
        }
    }
}
