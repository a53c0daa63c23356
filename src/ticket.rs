//! Installation tickets for app-gallery distributed release packages.
//!
//! A ticket is a PKCS #7 signed-data object wrapping a profile-style JSON document that names the
//! bundle and the devices it may be installed on.

use std::collections::HashMap;

use log::{debug, error};

use crate::config::{TrustStore, VerifierConfig};
use crate::pkcs7::Pkcs7Context;
use crate::provision::ProvisionInfo;
use crate::trust::MatchState;
use crate::{Error, Result};

/// Supplies the ticket installed for a bundle, if any.
pub trait TicketSource: Send + Sync {
    fn ticket_for(&self, bundle_name: &str) -> Option<Vec<u8>>;
}

/// A ticket source that never has a ticket.
pub struct NoTickets;

impl TicketSource for NoTickets {
    fn ticket_for(&self, _bundle_name: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Tickets held in memory, keyed by bundle name.
#[derive(Default)]
pub struct MemoryTicketSource {
    tickets: HashMap<String, Vec<u8>>,
}

impl MemoryTicketSource {
    pub fn insert(&mut self, bundle_name: &str, ticket: Vec<u8>) {
        self.tickets.insert(bundle_name.to_string(), ticket);
    }
}

impl TicketSource for MemoryTicketSource {
    fn ticket_for(&self, bundle_name: &str) -> Option<Vec<u8>> {
        self.tickets.get(bundle_name).cloned()
    }
}

/// Checks `ticket` against the profile it must authorize. Returns whether the CRL cache changed
/// while verifying the ticket signature.
pub fn check_ticket(
    ticket: &[u8],
    profile: &ProvisionInfo,
    trust: &TrustStore,
    config: &VerifierConfig,
) -> Result<bool> {
    let mut ctx = Pkcs7Context::parse(ticket)?;
    ctx.verify(trust, config.debug_mode)?;
    let result = ctx.match_ticket_source(trust, config.debug_mode);
    if result.state != MatchState::MatchTicket {
        error!("ticket signer {} is not a trusted ticket source", ctx.cert_issuer);
        return Err(Error::Policy("untrusted ticket signer".to_string()));
    }

    let json = std::str::from_utf8(&ctx.content)
        .map_err(|e| Error::Policy(format!("ticket is not UTF-8: {e}")))?;
    let ticket_info = ProvisionInfo::from_json(json)?;
    if ticket_info.bundle_info.bundle_name != profile.bundle_info.bundle_name {
        return Err(Error::Policy(format!(
            "ticket is for {} rather than {}",
            ticket_info.bundle_info.bundle_name, profile.bundle_info.bundle_name
        )));
    }
    let device_id = match &config.device_id {
        Some(id) => id,
        None => return Err(Error::Policy("no local device id".to_string())),
    };
    if !ticket_info.debug_info.device_ids.iter().any(|d| d == device_id) {
        return Err(Error::Policy("ticket does not list this device".to_string()));
    }
    debug!("ticket accepted for {}", profile.bundle_info.bundle_name);
    Ok(ctx.need_write_crl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_returns_inserted_tickets() {
        let mut source = MemoryTicketSource::default();
        source.insert("com.example.demo", vec![1, 2, 3]);
        assert_eq!(Some(vec![1, 2, 3]), source.ticket_for("com.example.demo"));
        assert_eq!(None, source.ticket_for("com.example.other"));
        assert_eq!(None, NoTickets.ticket_for("com.example.demo"));
    }
}
