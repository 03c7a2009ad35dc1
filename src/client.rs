//! Application-side client.
//!
//! A client is bound at startup to one allocator rank and is purely
//! synchronous: every public operation is one control-tag request followed
//! by a blocking wait for the bare result on the reply tag. Applications
//! never see where a vid lives; they only ever talk to their own allocator.

use crate::comm::{Endpoint, Envelope, Tag};
use crate::error::CommError;
use crate::proto::{ReadValue, Request};
use crate::storage::{Rank, Value, Vid};

pub struct Client {
    comm: Endpoint,
    allocator: Rank,
}

impl Client {
    pub fn new(comm: Endpoint, allocator: Rank) -> Self {
        Client { comm, allocator }
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    /// The allocator rank this application is bound to.
    pub fn allocator(&self) -> Rank {
        self.allocator
    }

    pub fn comm_mut(&mut self) -> &mut Endpoint {
        &mut self.comm
    }

    /// One logbook line at the client's current clock.
    pub fn note(&mut self, msg: &str) {
        self.comm.note(msg);
    }

    /// Allocate `size` cells somewhere in the cluster. `None` means the
    /// aggregate free capacity could not satisfy the request.
    pub fn allocate(&mut self, size: usize) -> Result<Option<Vid>, CommError> {
        let req = Request::Malloc { size: size.max(1), prev: None, excluded: Vec::new(), ctx: None };
        self.comm.send(&req, self.allocator, Tag::Ctl)?;
        let env: Envelope<Option<Vid>> = self.comm.recv(Some(self.allocator), Tag::Reply)?;
        Ok(env.data)
    }

    /// Read a variable. Scalar vids resolve to the whole entity; array vids
    /// need an index and resolve to the addressed cell.
    pub fn read(&mut self, vid: Vid, index: Option<usize>) -> Result<ReadValue, CommError> {
        self.comm.send(&Request::Read { vid, index, ctx: None }, self.allocator, Tag::Ctl)?;
        let env: Envelope<ReadValue> = self.comm.recv(Some(self.allocator), Tag::Reply)?;
        Ok(env.data)
    }

    /// Write a value; `false` means a concurrent writer with a later clock
    /// already got there.
    pub fn write(
        &mut self,
        vid: Vid,
        value: Value,
        index: Option<usize>,
    ) -> Result<bool, CommError> {
        self.comm.send(
            &Request::Write { vid, value, index, ctx: None },
            self.allocator,
            Tag::Ctl,
        )?;
        let env: Envelope<bool> = self.comm.recv(Some(self.allocator), Tag::Reply)?;
        Ok(env.data)
    }

    /// Release a vid; array chains are released segment by segment before
    /// the reply comes back.
    pub fn free(&mut self, vid: Vid) -> Result<bool, CommError> {
        self.comm.send(&Request::Free { vid, ctx: None }, self.allocator, Tag::Ctl)?;
        let env: Envelope<bool> = self.comm.recv(Some(self.allocator), Tag::Reply)?;
        Ok(env.data)
    }

    /// Fire-and-forget shutdown trigger; the request climbs to the root and
    /// the stop fans out from there.
    pub fn request_stop(&mut self, message: Option<String>) -> Result<(), CommError> {
        self.comm.send(&Request::RequestStop { message }, self.allocator, Tag::Ctl)
    }
}
