//! Trusted signing sources and the matcher that maps a signer identity onto them.
//!
//! App sources are matched on exact issuer and subject strings; ticket sources match the
//! subject against a regular expression that must cover the whole subject.

use log::{debug, info};
use regex::Regex;
use serde::Deserialize;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatchState {
    NoMatch,
    MatchSign,
    MatchProfile,
    MatchProfileDebug,
    MatchTicket,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AppSource {
    Other,
    AppGallery,
    AppSystem,
    ThirdPartyPreload,
}

impl AppSource {
    pub fn from_name(name: &str) -> Self {
        match name {
            "huawei app gallery" => AppSource::AppGallery,
            "huawei system apps" => AppSource::AppSystem,
            "third_party app preload" => AppSource::ThirdPartyPreload,
            _ => AppSource::Other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MatchingResult {
    pub state: MatchState,
    pub source: AppSource,
}

impl MatchingResult {
    pub const NO_MATCH: MatchingResult = MatchingResult {
        state: MatchState::NoMatch,
        source: AppSource::Other,
    };

    pub fn is_match(&self) -> bool {
        self.state != MatchState::NoMatch
    }
}

impl Default for MatchingResult {
    fn default() -> Self {
        MatchingResult::NO_MATCH
    }
}

/// What a signature covers, which selects the subject field an app source is matched on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobKind {
    AppSignature,
    Profile,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppSourceEntry {
    pub name: String,
    #[serde(rename = "app-signing-cert", default)]
    pub app_signing_cert: String,
    #[serde(rename = "profile-signing-certificate", default)]
    pub profile_signing_cert: String,
    #[serde(rename = "profile-debug-signing-certificate", default)]
    pub profile_debug_signing_cert: String,
    #[serde(rename = "issuer-ca")]
    pub issuer: String,
    #[serde(rename = "max-certs-path")]
    pub max_certs_path: usize,
}

#[derive(Deserialize)]
struct AppSourceList {
    #[serde(rename = "version-code", default)]
    version_code: i64,
    #[serde(rename = "version-name", default)]
    version_name: String,
    #[serde(rename = "trust-app-gallery")]
    sources: Vec<AppSourceEntry>,
}

#[derive(Deserialize)]
struct TicketSourceEntryJson {
    name: String,
    #[serde(rename = "ticket-signing-cert")]
    ticket_signing_cert: String,
    #[serde(rename = "issuer-ca")]
    issuer: String,
    #[serde(rename = "max-certs-path")]
    max_certs_path: usize,
}

#[derive(Deserialize)]
struct TicketSourceList {
    #[serde(rename = "version-code", default)]
    version_code: i64,
    #[serde(rename = "version-name", default)]
    version_name: String,
    #[serde(rename = "trust-ticket")]
    sources: Vec<TicketSourceEntryJson>,
}

#[derive(Clone, Debug)]
pub struct TicketSourceEntry {
    pub name: String,
    pub subject_pattern: Regex,
    pub issuer: String,
    pub max_certs_path: usize,
}

impl TicketSourceEntry {
    pub fn new(name: &str, pattern: &str, issuer: &str, max_certs_path: usize) -> Result<Self> {
        let subject_pattern = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|e| Error::Config(format!("ticket source {name}: {e}")))?;
        Ok(TicketSourceEntry {
            name: name.to_string(),
            subject_pattern,
            issuer: issuer.to_string(),
            max_certs_path,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct TrustedSources {
    apps: Vec<AppSourceEntry>,
    debug_apps: Vec<AppSourceEntry>,
    tickets: Vec<TicketSourceEntry>,
    debug_tickets: Vec<TicketSourceEntry>,
}

impl TrustedSources {
    pub fn from_json(apps: &str, tickets: &str) -> Result<Self> {
        let mut sources = TrustedSources::default();
        sources.apps = parse_app_sources(apps)?;
        sources.tickets = parse_ticket_sources(tickets)?;
        Ok(sources)
    }

    /// Loads the test overlays; they are consulted only when a query runs in debug mode.
    pub fn load_debug_overlay(&mut self, apps: Option<&str>, tickets: Option<&str>) -> Result<()> {
        if let Some(json) = apps {
            self.debug_apps = parse_app_sources(json)?;
        }
        if let Some(json) = tickets {
            self.debug_tickets = parse_ticket_sources(json)?;
        }
        Ok(())
    }

    pub fn add_app_source(&mut self, entry: AppSourceEntry) {
        self.apps.push(entry);
    }

    pub fn add_ticket_source(&mut self, entry: TicketSourceEntry) {
        self.tickets.push(entry);
    }

    pub fn is_trusted_app_source(
        &self,
        subject: &str,
        issuer: &str,
        kind: BlobKind,
        chain_len: usize,
        debug_mode: bool,
    ) -> MatchingResult {
        let result = match_app_sources(&self.apps, subject, issuer, kind, chain_len);
        if result.is_match() || !debug_mode {
            return result;
        }
        debug!("no production app source for {subject}, trying test sources");
        match_app_sources(&self.debug_apps, subject, issuer, kind, chain_len)
    }

    pub fn is_trusted_ticket_source(
        &self,
        subject: &str,
        issuer: &str,
        chain_len: usize,
        debug_mode: bool,
    ) -> MatchingResult {
        let result = match_ticket_sources(&self.tickets, subject, issuer, chain_len);
        if result.is_match() || !debug_mode {
            return result;
        }
        match_ticket_sources(&self.debug_tickets, subject, issuer, chain_len)
    }
}

fn parse_app_sources(json: &str) -> Result<Vec<AppSourceEntry>> {
    let list: AppSourceList = serde_json::from_str(json)?;
    info!(
        "loaded {} app sources, version {} ({})",
        list.sources.len(),
        list.version_name,
        list.version_code
    );
    Ok(list.sources)
}

fn parse_ticket_sources(json: &str) -> Result<Vec<TicketSourceEntry>> {
    let list: TicketSourceList = serde_json::from_str(json)?;
    info!(
        "loaded {} ticket sources, version {} ({})",
        list.sources.len(),
        list.version_name,
        list.version_code
    );
    list.sources
        .iter()
        .map(|s| TicketSourceEntry::new(&s.name, &s.ticket_signing_cert, &s.issuer, s.max_certs_path))
        .collect()
}

fn match_app_sources(
    entries: &[AppSourceEntry],
    subject: &str,
    issuer: &str,
    kind: BlobKind,
    chain_len: usize,
) -> MatchingResult {
    for entry in entries {
        if entry.issuer != issuer || entry.max_certs_path != chain_len {
            continue;
        }
        let state = match kind {
            BlobKind::AppSignature if entry.app_signing_cert == subject => MatchState::MatchSign,
            BlobKind::Profile if entry.profile_signing_cert == subject => MatchState::MatchProfile,
            BlobKind::Profile if entry.profile_debug_signing_cert == subject => {
                MatchState::MatchProfileDebug
            }
            _ => continue,
        };
        return MatchingResult {
            state,
            source: AppSource::from_name(&entry.name),
        };
    }
    MatchingResult::NO_MATCH
}

fn match_ticket_sources(
    entries: &[TicketSourceEntry],
    subject: &str,
    issuer: &str,
    chain_len: usize,
) -> MatchingResult {
    entries
        .iter()
        .find(|entry| {
            entry.issuer == issuer
                && entry.max_certs_path == chain_len
                && entry.subject_pattern.is_match(subject)
        })
        .map(|entry| MatchingResult {
            state: MatchState::MatchTicket,
            source: AppSource::from_name(&entry.name),
        })
        .unwrap_or(MatchingResult::NO_MATCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISSUER: &str = "C=CN, O=Huawei, OU=Huawei CBG, CN=Huawei CBG Software Signing Service CA";
    const TICKET_SUBJECT: &str = "C=CN, O=Huawei, OU=MemberCenter, CN=MemberShip ticket Release V1";

    const APPS: &str = r#"{
        "version-code": 1,
        "version-name": "1.0.0",
        "trust-app-gallery": [
            {
                "name": "huawei app gallery",
                "app-signing-cert": "C=CN, O=Huawei, OU=HOS AppGallery, CN=HOS AppGallery Application Release",
                "profile-signing-certificate": "C=CN, O=Huawei, OU=HOS AppGallery, CN=HOS Profile Management",
                "profile-debug-signing-certificate": "C=CN, O=Huawei, OU=HOS AppGallery, CN=HOS Profile Management Debug",
                "issuer-ca": "C=CN, O=Huawei, OU=Huawei CBG, CN=Huawei CBG Software Signing Service CA",
                "max-certs-path": 3
            },
            {
                "name": "huawei system apps",
                "app-signing-cert": "C=CN, O=Huawei, OU=HOS Open Platform, CN=HOS Application Release",
                "profile-signing-certificate": "",
                "profile-debug-signing-certificate": "",
                "issuer-ca": "C=CN, O=Huawei, OU=Huawei CBG, CN=Huawei CBG Software Signing Service CA",
                "max-certs-path": 3
            }
        ]
    }"#;

    fn tickets() -> String {
        format!(
            r#"{{
                "version-code": 1,
                "version-name": "1.0.0",
                "trust-ticket": [
                    {{
                        "name": "huawei app gallery",
                        "ticket-signing-cert": "C=CN, O=Huawei, OU=MemberCenter, CN=MemberShip ticket Release V[0-9]+",
                        "issuer-ca": "{ISSUER}",
                        "max-certs-path": 3
                    }}
                ]
            }}"#
        )
    }

    fn sources() -> TrustedSources {
        TrustedSources::from_json(APPS, &tickets()).unwrap()
    }

    #[test]
    fn matches_app_signature_exactly() {
        let sources = sources();
        let subject = "C=CN, O=Huawei, OU=HOS AppGallery, CN=HOS AppGallery Application Release";
        let result = sources.is_trusted_app_source(subject, ISSUER, BlobKind::AppSignature, 3, false);
        assert_eq!(MatchState::MatchSign, result.state);
        assert_eq!(AppSource::AppGallery, result.source);

        let result = sources.is_trusted_app_source(
            "C=CN, O=Huawei, OU=HOS Open Platform, CN=HOS Application Release",
            ISSUER,
            BlobKind::AppSignature,
            3,
            false,
        );
        assert_eq!(AppSource::AppSystem, result.source);

        let result =
            sources.is_trusted_app_source(&format!("{subject} "), ISSUER, BlobKind::AppSignature, 3, false);
        assert_eq!(MatchingResult::NO_MATCH, result);
    }

    #[test]
    fn chain_length_and_issuer_gate_matches() {
        let sources = sources();
        let subject = "C=CN, O=Huawei, OU=HOS AppGallery, CN=HOS AppGallery Application Release";
        assert!(!sources
            .is_trusted_app_source(subject, ISSUER, BlobKind::AppSignature, 2, false)
            .is_match());
        assert!(!sources
            .is_trusted_app_source(subject, "C=CN, O=Other", BlobKind::AppSignature, 3, false)
            .is_match());
    }

    #[test]
    fn profile_kinds_select_release_or_debug() {
        let sources = sources();
        let release = sources.is_trusted_app_source(
            "C=CN, O=Huawei, OU=HOS AppGallery, CN=HOS Profile Management",
            ISSUER,
            BlobKind::Profile,
            3,
            false,
        );
        assert_eq!(MatchState::MatchProfile, release.state);
        let debug = sources.is_trusted_app_source(
            "C=CN, O=Huawei, OU=HOS AppGallery, CN=HOS Profile Management Debug",
            ISSUER,
            BlobKind::Profile,
            3,
            false,
        );
        assert_eq!(MatchState::MatchProfileDebug, debug.state);
        // An app signing subject is not a profile signer.
        let app = sources.is_trusted_app_source(
            "C=CN, O=Huawei, OU=HOS AppGallery, CN=HOS AppGallery Application Release",
            ISSUER,
            BlobKind::Profile,
            3,
            false,
        );
        assert!(!app.is_match());
    }

    #[test]
    fn ticket_subject_must_match_whole_pattern() {
        let sources = sources();
        let result = sources.is_trusted_ticket_source(TICKET_SUBJECT, ISSUER, 3, false);
        assert_eq!(MatchState::MatchTicket, result.state);
        assert_eq!(AppSource::AppGallery, result.source);

        let result = sources.is_trusted_ticket_source(&format!("{TICKET_SUBJECT} "), ISSUER, 3, false);
        assert_eq!(MatchingResult::NO_MATCH, result);

        let result = sources.is_trusted_ticket_source(TICKET_SUBJECT, "C=CN, O=Other", 3, false);
        assert_eq!(MatchingResult::NO_MATCH, result);
    }

    #[test]
    fn debug_overlay_only_in_debug_mode() {
        let mut sources = sources();
        let overlay = r#"{
            "trust-app-gallery": [
                {
                    "name": "huawei app gallery",
                    "app-signing-cert": "C=CN, O=Test, CN=Test App",
                    "issuer-ca": "C=CN, O=Test, CN=Test CA",
                    "max-certs-path": 3
                }
            ]
        }"#;
        sources.load_debug_overlay(Some(overlay), None).unwrap();
        let subject = "C=CN, O=Test, CN=Test App";
        let issuer = "C=CN, O=Test, CN=Test CA";
        assert!(!sources
            .is_trusted_app_source(subject, issuer, BlobKind::AppSignature, 3, false)
            .is_match());
        assert_eq!(
            MatchState::MatchSign,
            sources
                .is_trusted_app_source(subject, issuer, BlobKind::AppSignature, 3, true)
                .state
        );
    }

    #[test]
    fn first_matching_entry_wins() {
        let mut sources = TrustedSources::default();
        for name in ["huawei system apps", "huawei app gallery"] {
            sources.add_app_source(AppSourceEntry {
                name: name.to_string(),
                app_signing_cert: "CN=App".to_string(),
                profile_signing_cert: String::new(),
                profile_debug_signing_cert: String::new(),
                issuer: "CN=CA".to_string(),
                max_certs_path: 2,
            });
        }
        let result = sources.is_trusted_app_source("CN=App", "CN=CA", BlobKind::AppSignature, 2, false);
        assert_eq!(AppSource::AppSystem, result.source);
    }

    #[test]
    fn invalid_ticket_pattern_is_a_config_error() {
        assert!(matches!(
            TicketSourceEntry::new("bad", "V[0-9", ISSUER, 3),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn ticket_pattern_must_cover_the_whole_subject() {
        let mut sources = TrustedSources::default();
        sources.add_ticket_source(
            TicketSourceEntry::new("cn only", "MemberShip ticket Release V[0-9]+", ISSUER, 3)
                .unwrap(),
        );
        assert_eq!(
            MatchingResult::NO_MATCH,
            sources.is_trusted_ticket_source(TICKET_SUBJECT, ISSUER, 3, false)
        );

        sources.add_ticket_source(
            TicketSourceEntry::new("any prefix", ".*CN=MemberShip ticket Release V[0-9]+", ISSUER, 3)
                .unwrap(),
        );
        assert_eq!(
            MatchState::MatchTicket,
            sources
                .is_trusted_ticket_source(TICKET_SUBJECT, ISSUER, 3, false)
                .state
        );
    }
}
