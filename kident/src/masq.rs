//! Answers lookups for connections this host masquerades.
//!
//! The NAT records of the active backend are walked in order; the first one
//! that produces an answer or a forwarded reply ends the search.

use crate::{
    conntrack::TrackingBackend,
    endpoint::{ConnQuery, EndPoint, NatRecord},
    forward::Forwarder,
    ident::{IdentSource, Identity},
    logging,
    lookup::OwnerLookup,
    options::{Flags, Options},
    overrides::MasqOverrides,
    reply::{write_error, write_userid, IdentError},
};
use log::debug;
use std::{
    io::Write,
    net::{IpAddr, Ipv4Addr},
};

/// How a masqueraded lookup ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// USERID reply from this host
    Answered,
    /// HIDDEN-USER reply
    Hidden,
    /// USERID reply relayed from the internal host
    Forwarded,
    /// NO-USER reply
    NoUser,
    /// Nothing was written
    Failed,
}

impl Outcome {
    pub fn replied(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Per-record verdict
enum Step {
    Skip,
    Done(Outcome),
}

/// Collaborators of a masquerade lookup
pub struct MasqResolver<'a> {
    pub owners: &'a mut dyn OwnerLookup,
    pub overrides: &'a dyn MasqOverrides,
    pub forwarder: &'a mut dyn Forwarder,
    pub idents: &'a dyn IdentSource,
    pub opts: &'a Options,
    /// Reported operating system for local answers
    pub os: &'a str,
}

fn v4(ep: &EndPoint) -> Ipv4Addr {
    ep.ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED)
}

impl MasqResolver<'_> {
    /// Writes the reply for `query` to `out`, if any
    pub fn resolve_masquerade<W: Write + ?Sized>(
        &mut self,
        out: &mut W,
        query: &ConnQuery,
        backend: &mut TrackingBackend,
    ) -> Result<Outcome, anyhow::Error> {
        if query.is_ipv6() {
            debug!("Masquerade lookup rejected for IPv6 peer {}", query.foreign);
            return Ok(Outcome::Failed);
        }

        let records = match backend.nat_records(Some(query.local.port), Some(query.foreign.port)) {
            Ok(records) => records,
            Err(e) => {
                debug!("{:#}", e);
                return Ok(Outcome::Failed);
            }
        };

        for rec in records {
            if let Step::Done(outcome) = self.try_record(out, query, &rec)? {
                return Ok(outcome);
            }
        }
        Ok(Outcome::Failed)
    }

    fn try_record<W: Write + ?Sized>(
        &mut self,
        out: &mut W,
        query: &ConnQuery,
        rec: &NatRecord,
    ) -> Result<Step, anyhow::Error> {
        if rec.is_local_loop() {
            return self.answer_local_loop(out, query, rec);
        }

        if rec.reply_src.ipaddr != query.foreign.ipaddr {
            let proxy = self.opts.proxy();
            let relayed = match proxy {
                Some(proxy) => query.foreign.ipaddr == proxy && rec.orig_dst.ipaddr != proxy,
                None => false,
            };
            if !relayed {
                return Ok(Step::Skip);
            }
        }

        let (lport, fport) = (query.local.port, query.foreign.port);
        let masq = Some((rec.orig_src.port, rec.orig_dst.port));
        let internal = rec.internal();
        let host = v4(internal);
        let fixed = self.overrides.find(host);

        if self.opts.enabled(Flags::FORWARD)
            && (fixed.is_none() || !self.opts.enabled(Flags::MASQ_OVERRIDE))
        {
            match self.forwarder.forward(host, internal.port, rec.orig_dst.port) {
                Some(ident) => {
                    write_userid(out, lport, fport, &ident.os, &ident.user)?;
                    logging::audit_forwarded(
                        &query.foreign,
                        host,
                        lport,
                        fport,
                        masq,
                        &ident.user,
                        &ident.os,
                    );
                    return Ok(Step::Done(Outcome::Forwarded));
                }
                None => debug!("Forward to {} ({} {}) failed", host, internal.port, fport),
            }
        }

        match fixed {
            Some(ident) => {
                write_userid(out, lport, fport, &ident.os, &ident.user)?;
                logging::audit_masqueraded(
                    &query.foreign,
                    lport,
                    fport,
                    masq,
                    &ident.user,
                    &ident.os,
                );
                Ok(Step::Done(Outcome::Answered))
            }
            None => {
                write_error(out, lport, fport, IdentError::NoUser)?;
                Ok(Step::Done(Outcome::NoUser))
            }
        }
    }

    /// The host reached itself through NAT: the owner is a local socket
    fn answer_local_loop<W: Write + ?Sized>(
        &mut self,
        out: &mut W,
        query: &ConnQuery,
        rec: &NatRecord,
    ) -> Result<Step, anyhow::Error> {
        let inner = ConnQuery::new(
            EndPoint::new(query.local.ipaddr, rec.orig_src.port),
            EndPoint::new(IpAddr::V4(v4(&rec.orig_dst)), rec.orig_dst.port),
        );
        let Some(uid) = self.owners.owner(&inner).uid() else {
            debug!("No owner for looped connection {}", inner);
            return Ok(Step::Done(Outcome::Failed));
        };

        let (lport, fport) = (query.local.port, query.foreign.port);
        let (masq_lport, masq_fport) = (rec.orig_src.port, rec.orig_dst.port);
        match self.idents.identity(uid) {
            Identity::Unknown => {
                write_error(out, lport, fport, IdentError::NoUser)?;
                Ok(Step::Done(Outcome::NoUser))
            }
            Identity::Hidden(name) => {
                write_error(out, lport, fport, IdentError::HiddenUser)?;
                logging::audit_hidden(
                    &query.foreign,
                    lport,
                    fport,
                    Some((masq_lport, masq_fport)),
                    &name,
                );
                Ok(Step::Done(Outcome::Hidden))
            }
            Identity::User(name) => {
                write_userid(out, lport, fport, self.os, &name)?;
                logging::audit_local(
                    &query.foreign,
                    lport,
                    fport,
                    Some((masq_lport, masq_fport)),
                    &name,
                );
                Ok(Step::Done(Outcome::Answered))
            }
        }
    }
}
