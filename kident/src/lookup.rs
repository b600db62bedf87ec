//! Owner resolution for a local connection: socket diagnostics first, the
//! socket tables when that yields nothing.

use crate::{
    diag::DiagClient,
    endpoint::{ConnQuery, LookupResult},
    netlink::{NetlinkSocket, NlTransport},
    scanner::SocketTables,
};
use log::debug;

/// Finds the uid owning a local TCP connection
pub trait OwnerLookup {
    fn owner(&mut self, query: &ConnQuery) -> LookupResult;
}

pub struct UserLookup<T: NlTransport = NetlinkSocket> {
    pub diag: DiagClient<T>,
    pub tables: SocketTables,
}

impl<T: NlTransport> UserLookup<T> {
    pub fn new(diag: DiagClient<T>, tables: SocketTables) -> Self {
        Self { diag, tables }
    }
}

impl<T: NlTransport> OwnerLookup for UserLookup<T> {
    fn owner(&mut self, query: &ConnQuery) -> LookupResult {
        if self.diag.is_open() {
            let result = self.diag.query(query);
            if !result.is_missing() {
                return result;
            }
            debug!("No diag owner for {}, scanning socket tables", query);
        }
        self.tables.find_owner(query)
    }
}
