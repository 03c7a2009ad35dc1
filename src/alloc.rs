//! The allocator node.
//!
//! One `TreeAllocator` runs per allocator rank: a memory census against its
//! children at bootstrap, then a single-threaded dispatch loop that receives
//! any-source control envelopes and matches on the request variant. A public
//! operation either acts locally and flips into its reply variant, or is
//! forwarded unchanged toward the rank that can act; replies are routed back
//! toward the master with the same child/parent/ancestor rule, with no
//! forward-path stack carried on the wire.
//!
//! Handlers never receive inside themselves. Anything that needs an answer
//! from another node returns after sending, and the answer arrives as a
//! fresh envelope picked up by the loop.

use std::collections::{BTreeMap, HashMap};

use crate::comm::{Endpoint, Envelope, Tag};
use crate::error::{AllocError, CommError};
use crate::proto::{OpCtx, ReadValue, Request};
use crate::storage::{Array, Entity, Rank, Value, Variable, Vid};
use crate::tree::Topology;

/// Outcome of the local half of a read or write before any sending happens;
/// computed under the storage borrow, acted on after it ends.
enum Step {
    Reply(Request),
    Walk { next: Vid, remaining: usize },
    Forward,
}

pub struct TreeAllocator {
    comm: Endpoint,
    topo: Topology,
    local_size: usize,
    initial_capacity: usize,
    subtree_size: usize,
    memory_map: BTreeMap<Rank, usize>,
    variables: HashMap<Vid, Entity>,
    next_seq: u64,
    stop: bool,
}

impl TreeAllocator {
    pub fn new(comm: Endpoint, nb_children: usize, node_size: usize, tree_size: usize) -> Self {
        let topo = Topology::new(comm.rank(), nb_children, tree_size);
        let memory_map = topo.children.iter().map(|&c| (c, 0)).collect();
        TreeAllocator {
            comm,
            topo,
            local_size: node_size,
            initial_capacity: node_size,
            subtree_size: node_size,
            memory_map,
            variables: HashMap::new(),
            next_seq: 0,
            stop: false,
        }
    }

    pub fn rank(&self) -> Rank {
        self.topo.rank
    }

    pub fn local_size(&self) -> usize {
        self.local_size
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    /// Capacity cells currently occupied by resident entities.
    pub fn occupied_cells(&self) -> usize {
        self.variables.values().map(Entity::cells).sum()
    }

    pub fn resident(&self) -> &HashMap<Vid, Entity> {
        &self.variables
    }

    pub fn memory_map(&self) -> &BTreeMap<Rank, usize> {
        &self.memory_map
    }

    /// Serve until the stop protocol reaches this node. Any error is fatal:
    /// logged, then the whole world is aborted.
    pub fn run(mut self) -> Result<(), AllocError> {
        match self.serve() {
            Ok(()) => {
                self.comm.note(&format!(
                    "end of process {}, {} entities resident, {} cells free",
                    self.topo.rank,
                    self.variables.len(),
                    self.local_size
                ));
                Ok(())
            }
            Err(AllocError::Comm(CommError::Aborted)) => Err(AllocError::Comm(CommError::Aborted)),
            Err(e) => {
                self.comm.note(&format!("fatal: {e}"));
                tracing::error!(rank = self.topo.rank, error = %e, "allocator failed, aborting the world");
                self.comm.abort_world();
                Err(e)
            }
        }
    }

    fn serve(&mut self) -> Result<(), AllocError> {
        self.bootstrap()?;
        while !self.stop {
            self.step()?;
        }
        Ok(())
    }

    /// Receive and dispatch exactly one control envelope.
    pub fn step(&mut self) -> Result<(), AllocError> {
        let env: Envelope<Request> = self.comm.recv(None, Tag::Ctl)?;
        self.comm.note(&format!("dispatch \"{}\"", env.data.name()));
        let Envelope { src, clock, data, .. } = env;
        match data {
            Request::Malloc { size, prev, excluded, ctx } => {
                self.on_malloc(src, size, prev, excluded, ctx)
            }
            Request::MallocReply { vid, excluded, ctx } => {
                self.on_malloc_reply(src, vid, excluded, ctx)
            }
            Request::Read { vid, index, ctx } => self.on_read(src, vid, index, ctx),
            Request::ReadReply { variable, ctx } => {
                self.phase_b(ctx, Request::ReadReply { variable, ctx })
            }
            Request::Write { vid, value, index, ctx } => {
                self.on_write(src, clock, vid, value, index, ctx)
            }
            Request::WriteReply { response, ctx } => {
                self.phase_b(ctx, Request::WriteReply { response, ctx })
            }
            Request::Free { vid, ctx } => self.on_free(src, vid, ctx),
            Request::FreeReply { response, ctx } => {
                self.phase_b(ctx, Request::FreeReply { response, ctx })
            }
            Request::RequestStop { message } => self.on_request_stop(message),
            Request::Stop => self.on_stop(),
        }
    }

    /// Gather each child's subtree capacity on the bootstrap tag, then
    /// report the accumulated total upward. The resulting memory map is a
    /// hint frozen at startup; `excluded` corrects it at runtime.
    pub fn bootstrap(&mut self) -> Result<(), AllocError> {
        self.comm.note("memory census: waiting for child subtree sizes");
        for _ in 0..self.topo.children.len() {
            let env: Envelope<usize> = self.comm.recv(None, Tag::Init)?;
            if !self.topo.is_child(env.src) {
                return Err(AllocError::Census(format!(
                    "census report from rank {} which is not a child of {}",
                    env.src, self.topo.rank
                )));
            }
            self.memory_map.insert(env.src, env.data);
            self.subtree_size += env.data;
        }
        if let Some(parent) = self.topo.parent {
            self.comm.send(&self.subtree_size, parent, Tag::Init)?;
        }
        self.comm.note(&format!(
            "census done: subtree capacity {}, memory map {:?}",
            self.subtree_size, self.memory_map
        ));
        Ok(())
    }

    /// First entry of a public operation stamps where it entered the tree
    /// and who is waiting for the result.
    fn stamp(&self, ctx: Option<OpCtx>, src: Rank) -> OpCtx {
        ctx.unwrap_or(OpCtx { master: self.topo.rank, caller: src })
    }

    fn fresh_vid(&mut self, request_rank: Rank) -> Vid {
        let vid = Vid::new(request_rank, self.topo.rank, self.next_seq);
        self.next_seq += 1;
        vid
    }

    /// Route a reply toward the master; deliver the bare result to the
    /// caller once it gets there.
    fn phase_b(&mut self, ctx: OpCtx, reply: Request) -> Result<(), AllocError> {
        if self.topo.rank == ctx.master {
            match reply {
                Request::MallocReply { vid, .. } => {
                    self.comm.send(&vid, ctx.caller, Tag::Reply)?
                }
                Request::ReadReply { variable, .. } => {
                    self.comm.send(&variable, ctx.caller, Tag::Reply)?
                }
                Request::WriteReply { response, .. } | Request::FreeReply { response, .. } => {
                    self.comm.send(&response, ctx.caller, Tag::Reply)?
                }
                _ => unreachable!("phase B only routes reply variants"),
            }
            return Ok(());
        }
        let hop = self
            .topo
            .next_hop_toward(ctx.master)
            .ok_or(AllocError::NoRoute { from: self.topo.rank, to: ctx.master })?;
        self.comm.send(&reply, hop, Tag::Ctl)?;
        Ok(())
    }

    /// Forward an access operation one hop toward the vid's owner. A vid
    /// whose owner is this very node but which is not resident has been
    /// freed or fabricated; both are fatal.
    fn forward_access(&mut self, vid: Vid, req: Request) -> Result<(), AllocError> {
        let owner = vid.owner_rank;
        if owner == self.topo.rank {
            return Err(AllocError::VidNotResident(vid, owner));
        }
        let hop = self
            .topo
            .next_hop_toward(owner)
            .ok_or(AllocError::NoRoute { from: self.topo.rank, to: owner })?;
        if hop == owner {
            self.comm.note("a child or the parent owns the variable");
        }
        self.comm.send(&req, hop, Tag::Ctl)?;
        Ok(())
    }

    fn on_malloc(
        &mut self,
        src: Rank,
        size: usize,
        prev: Option<Vid>,
        mut excluded: Vec<Rank>,
        ctx: Option<OpCtx>,
    ) -> Result<(), AllocError> {
        let ctx = self.stamp(ctx, src);
        // a child only sends malloc upward once its whole subtree refused
        if self.topo.is_child(src) && !excluded.contains(&src) {
            excluded.push(src);
        }

        let size = size.max(1);
        let local_alloc = size.min(self.local_size);
        let child_alloc = size - local_alloc;

        let mut chain = prev;
        if local_alloc > 0 {
            self.local_size -= local_alloc;
            let vid = self.fresh_vid(ctx.caller);
            let entity = if size == 1 && prev.is_none() {
                Entity::Scalar(Variable::new(vid))
            } else {
                Entity::Segment(Array::new(vid, local_alloc, prev))
            };
            self.variables.insert(vid, entity);
            self.comm.note(&format!("placed {local_alloc} cell(s) as {vid:?}"));
            chain = Some(vid);
            if child_alloc == 0 {
                return self.on_malloc_reply(self.topo.rank, Some(vid), excluded, ctx);
            }
        }

        let onward = Request::Malloc {
            size: child_alloc,
            prev: chain,
            excluded: excluded.clone(),
            ctx: Some(ctx),
        };
        // lowest-ranked child first: deterministic tie-break for routing traces
        if let Some(&child) = self.topo.children.iter().find(|c| !excluded.contains(*c)) {
            self.comm.send(&onward, child, Tag::Ctl)?;
            return Ok(());
        }
        if let Some(parent) = self.topo.parent {
            self.comm.send(&onward, parent, Tag::Ctl)?;
            return Ok(());
        }
        self.comm.note("allocation exhausted: no local space, no child left, no parent");
        self.on_malloc_reply(self.topo.rank, None, excluded, ctx)
    }

    fn on_malloc_reply(
        &mut self,
        src: Rank,
        vid: Option<Vid>,
        mut excluded: Vec<Rank>,
        ctx: OpCtx,
    ) -> Result<(), AllocError> {
        if vid.is_none() && self.topo.is_child(src) {
            if !excluded.contains(&src) {
                excluded.push(src);
            }
            // the census hint is stale the moment a subtree reports empty
            self.memory_map.entry(src).and_modify(|m| *m = 0);
        }
        self.phase_b(ctx, Request::MallocReply { vid, excluded, ctx })
    }

    fn on_read(
        &mut self,
        src: Rank,
        vid: Vid,
        index: Option<usize>,
        ctx: Option<OpCtx>,
    ) -> Result<(), AllocError> {
        let ctx = self.stamp(ctx, src);
        let step = match self.variables.get(&vid) {
            Some(Entity::Scalar(var)) => Step::Reply(Request::ReadReply {
                variable: ReadValue::Entity(var.clone()),
                ctx,
            }),
            Some(Entity::Segment(seg)) => {
                let idx = index.ok_or(AllocError::IndexRequired(vid))?;
                if idx < seg.size {
                    Step::Reply(Request::ReadReply {
                        variable: ReadValue::Cell(seg.cells[idx].clone()),
                        ctx,
                    })
                } else {
                    let remaining = idx - seg.size;
                    let next =
                        seg.next.ok_or(AllocError::IndexOutOfRange { vid, remaining })?;
                    Step::Walk { next, remaining }
                }
            }
            None => Step::Forward,
        };
        match step {
            Step::Reply(reply) => self.phase_b(ctx, reply),
            Step::Walk { next, remaining } => {
                self.comm.note(&format!("read walks the chain: {vid:?} -> {next:?}"));
                self.on_read(self.topo.rank, next, Some(remaining), Some(ctx))
            }
            Step::Forward => {
                self.forward_access(vid, Request::Read { vid, index, ctx: Some(ctx) })
            }
        }
    }

    fn on_write(
        &mut self,
        src: Rank,
        clock: u64,
        vid: Vid,
        value: Value,
        index: Option<usize>,
        ctx: Option<OpCtx>,
    ) -> Result<(), AllocError> {
        let ctx = self.stamp(ctx, src);
        let step = match self.variables.get_mut(&vid) {
            Some(Entity::Scalar(var)) => {
                if var.last_write_clock.map_or(true, |c| clock > c) {
                    var.value = value.clone();
                    var.last_write_clock = Some(clock);
                    Step::Reply(Request::WriteReply { response: true, ctx })
                } else {
                    Step::Reply(Request::WriteReply { response: false, ctx })
                }
            }
            Some(Entity::Segment(seg)) => {
                let idx = index.ok_or(AllocError::IndexRequired(vid))?;
                if idx < seg.size {
                    if seg.last_write_clock.map_or(true, |c| clock > c) {
                        seg.cells[idx] = value.clone();
                        seg.last_write_clock = Some(clock);
                        Step::Reply(Request::WriteReply { response: true, ctx })
                    } else {
                        Step::Reply(Request::WriteReply { response: false, ctx })
                    }
                } else {
                    let remaining = idx - seg.size;
                    let next =
                        seg.next.ok_or(AllocError::IndexOutOfRange { vid, remaining })?;
                    Step::Walk { next, remaining }
                }
            }
            None => Step::Forward,
        };
        match step {
            Step::Reply(reply) => {
                if matches!(&reply, Request::WriteReply { response: false, .. }) {
                    self.comm.note(&format!("stale write on {vid:?} rejected"));
                }
                self.phase_b(ctx, reply)
            }
            Step::Walk { next, remaining } => {
                self.on_write(self.topo.rank, clock, next, value, Some(remaining), Some(ctx))
            }
            Step::Forward => {
                self.forward_access(vid, Request::Write { vid, value, index, ctx: Some(ctx) })
            }
        }
    }

    fn on_free(&mut self, src: Rank, vid: Vid, ctx: Option<OpCtx>) -> Result<(), AllocError> {
        let ctx = self.stamp(ctx, src);
        match self.variables.remove(&vid) {
            Some(Entity::Scalar(_)) => {
                self.local_size += 1;
                self.comm.note(&format!("freed {vid:?}"));
                self.phase_b(ctx, Request::FreeReply { response: true, ctx })
            }
            Some(Entity::Segment(seg)) => {
                self.local_size += seg.size;
                self.comm.note(&format!("freed {vid:?} ({} cells)", seg.size));
                match seg.next {
                    // release the whole chain before the caller hears back
                    Some(next) => self.on_free(self.topo.rank, next, Some(ctx)),
                    None => self.phase_b(ctx, Request::FreeReply { response: true, ctx }),
                }
            }
            None => self.forward_access(vid, Request::Free { vid, ctx: Some(ctx) }),
        }
    }

    fn on_request_stop(&mut self, message: Option<String>) -> Result<(), AllocError> {
        match self.topo.parent {
            Some(parent) => {
                self.comm.send(&Request::RequestStop { message }, parent, Tag::Ctl)?;
                Ok(())
            }
            None => {
                if let Some(msg) = message {
                    self.comm.note(&format!("stop requested: {msg}"));
                }
                self.on_stop()
            }
        }
    }

    fn on_stop(&mut self) -> Result<(), AllocError> {
        self.stop = true;
        for &child in &self.topo.children {
            self.comm.send(&Request::Stop, child, Tag::Ctl)?;
        }
        Ok(())
    }
}
