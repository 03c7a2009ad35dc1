//! Control-plane wire protocol.
//!
//! Every envelope on the control tag carries one `Request` variant. The
//! variant tag plays the role the original handler-name string played, with
//! dispatch checked at compile time: public operations (`Malloc`, `Read`,
//! `Write`, `Free`) and internal transitions (the `*Reply` variants plus the
//! stop protocol) are disjoint sets of variants.

use crate::storage::{Rank, Value, Variable, Vid};
use serde::{Deserialize, Serialize};

/// Where a public operation entered the tree and who is waiting for it.
///
/// Stamped exactly once, by the first allocator a request reaches: `master`
/// is that allocator's rank, `caller` the application rank that must receive
/// the final result on the reply tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCtx {
    pub master: Rank,
    pub caller: Rank,
}

/// What a read resolves to: scalar vids yield the whole entity, indexed
/// array reads yield the addressed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadValue {
    Entity(Variable),
    Cell(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Allocate `size` cells somewhere below or above here. `prev` links the
    /// chain segment allocated on the previous hop; `excluded` lists child
    /// ranks whose subtrees already refused this request.
    Malloc {
        size: usize,
        prev: Option<Vid>,
        excluded: Vec<Rank>,
        ctx: Option<OpCtx>,
    },
    /// Allocation result riding back toward the master. `vid` is the chain
    /// head, or `None` when the cluster could not satisfy the request.
    MallocReply {
        vid: Option<Vid>,
        excluded: Vec<Rank>,
        ctx: OpCtx,
    },

    Read {
        vid: Vid,
        index: Option<usize>,
        ctx: Option<OpCtx>,
    },
    ReadReply {
        variable: ReadValue,
        ctx: OpCtx,
    },

    Write {
        vid: Vid,
        value: Value,
        index: Option<usize>,
        ctx: Option<OpCtx>,
    },
    WriteReply {
        response: bool,
        ctx: OpCtx,
    },

    Free {
        vid: Vid,
        ctx: Option<OpCtx>,
    },
    FreeReply {
        response: bool,
        ctx: OpCtx,
    },

    /// Climb to the root and ask it to stop the world.
    RequestStop { message: Option<String> },
    /// Root-originated shutdown, fanned out along tree edges.
    Stop,
}

impl Request {
    /// Short name used in dispatch logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Malloc { .. } => "malloc",
            Request::MallocReply { .. } => "malloc_reply",
            Request::Read { .. } => "read",
            Request::ReadReply { .. } => "read_reply",
            Request::Write { .. } => "write",
            Request::WriteReply { .. } => "write_reply",
            Request::Free { .. } => "free",
            Request::FreeReply { .. } => "free_reply",
            Request::RequestStop { .. } => "request_stop",
            Request::Stop => "stop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Vid;

    #[test]
    fn requests_survive_the_wire_encoding() {
        let req = Request::Malloc {
            size: 6,
            prev: Some(Vid::new(4, 1, 2)),
            excluded: vec![2, 3],
            ctx: Some(OpCtx { master: 1, caller: 4 }),
        };
        let bytes = bincode::serialize(&req).expect("encode");
        let back: Request = bincode::deserialize(&bytes).expect("decode");
        assert_eq!(req, back);
    }
}
