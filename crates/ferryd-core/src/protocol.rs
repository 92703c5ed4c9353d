// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protocol parameter resolution.
//!
//! Picks the effective stream count, TCP buffer size and timeout for one
//! transfer from the link configuration, by specificity: an exact SE-pair
//! link wins outright, then a group-pair link, then the merge of the most
//! specific standalone source and destination links. Fields stored as the
//! "automatic" sentinel are substituted with live optimizer values.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CoreError;
use crate::persistence::{ANY, Persistence, ShareConfig, TransferFile, WILDCARD};

/// Sentinel marking a link configuration field as auto-tuned.
pub const AUTOMATIC: i32 = -1;

/// Fallback stream count when nothing is configured.
pub const DEFAULT_NOSTREAMS: i32 = 4;

/// Fallback transfer timeout in seconds.
pub const DEFAULT_TIMEOUT: i32 = 3600;

/// Fallback TCP buffer size; zero leaves the choice to the transport.
pub const DEFAULT_BUFFER_SIZE: i32 = 0;

/// Per-transfer parameters supplied by the submitter.
///
/// Serialized as comma-separated `key:value` tokens plus bare boolean
/// flags, for example `nostreams:8,timeout:7200,strict`. When present they
/// bypass link configuration entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProtocol {
    /// Requested parallel stream count.
    pub nostreams: Option<i32>,
    /// Requested transfer timeout in seconds.
    pub timeout: Option<i32>,
    /// Requested TCP buffer size in bytes.
    pub buffer_size: Option<i32>,
    /// Disable all transfer preparation checks.
    pub strict_copy: bool,
    /// Force IPv4.
    pub ipv4: bool,
    /// Force IPv6.
    pub ipv6: bool,
}

impl UserProtocol {
    /// Parse a serialized parameter string. Returns `None` when no
    /// recognized token is present; unknown tokens are ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parsed = Self::default();
        let mut matched = false;
        for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once(':') {
                Some(("nostreams", value)) => {
                    if let Ok(n) = value.parse() {
                        parsed.nostreams = Some(n);
                        matched = true;
                    }
                }
                Some(("timeout", value)) => {
                    if let Ok(n) = value.parse() {
                        parsed.timeout = Some(n);
                        matched = true;
                    }
                }
                Some(("buffersize", value)) => {
                    if let Ok(n) = value.parse() {
                        parsed.buffer_size = Some(n);
                        matched = true;
                    }
                }
                None if token == "strict" => {
                    parsed.strict_copy = true;
                    matched = true;
                }
                None if token == "ipv4" => {
                    parsed.ipv4 = true;
                    matched = true;
                }
                None if token == "ipv6" => {
                    parsed.ipv6 = true;
                    matched = true;
                }
                _ => {}
            }
        }
        matched.then_some(parsed)
    }
}

/// Effective protocol parameters for one transfer.
///
/// Fields may be zero or negative, meaning unset; the executor omits such
/// fields from the subprocess argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProtocol {
    /// Parallel stream count.
    pub nostreams: i32,
    /// TCP buffer size in bytes.
    pub buffer_size: i32,
    /// Transfer timeout in seconds.
    pub timeout: i32,
    auto_tuned: bool,
}

impl ResolvedProtocol {
    /// True when any effective field came from auto-tuning. Selects the
    /// optimized persistence path and suppresses the manual-config marker.
    pub fn is_auto(&self) -> bool {
        self.auto_tuned
    }

    /// Serialized form stored alongside the file row.
    pub fn params_string(&self) -> String {
        format!(
            "nostreams:{},timeout:{},buffersize:{}",
            self.nostreams, self.timeout, self.buffer_size
        )
    }
}

/// Link configuration flavor, ordered by specificity within each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LinkFlavor {
    SePair,
    GroupPair,
    SourceSe,
    SourceGroup,
    SourceWildcard,
    DestinationSe,
    DestinationGroup,
    DestinationWildcard,
}

const SOURCE_ORDER: [LinkFlavor; 3] = [
    LinkFlavor::SourceSe,
    LinkFlavor::SourceGroup,
    LinkFlavor::SourceWildcard,
];

const DESTINATION_ORDER: [LinkFlavor; 3] = [
    LinkFlavor::DestinationSe,
    LinkFlavor::DestinationGroup,
    LinkFlavor::DestinationWildcard,
];

/// Resolves effective protocol parameters from assigned share rows.
pub struct ProtocolResolver {
    db: Arc<dyn Persistence>,
}

impl ProtocolResolver {
    /// Create a resolver backed by the given persistence.
    pub fn new(db: Arc<dyn Persistence>) -> Self {
        Self { db }
    }

    /// Resolve parameters for `file` from the share rows assigned to it.
    ///
    /// Returns `None` when no applicable link configuration exists; the
    /// caller falls back to system defaults.
    pub async fn resolve(
        &self,
        file: &TransferFile,
        shares: &[ShareConfig],
    ) -> Result<Option<ResolvedProtocol>, CoreError> {
        let links = self.classify(shares).await?;

        if let Some(names) = links.get(&LinkFlavor::SePair) {
            return self.link_protocol(names).await;
        }
        if let Some(names) = links.get(&LinkFlavor::GroupPair) {
            return self.link_protocol(names).await;
        }

        let source = self.first_link(&links, &SOURCE_ORDER).await?;
        let destination = self.first_link(&links, &DESTINATION_ORDER).await?;
        self.merge(file, source, destination).await
    }

    /// Sort share rows into link flavor slots.
    ///
    /// Whether a concrete name denotes an SE or a group is a membership
    /// lookup, done before any specificity decision.
    async fn classify(
        &self,
        shares: &[ShareConfig],
    ) -> Result<HashMap<LinkFlavor, (String, String)>, CoreError> {
        let mut links = HashMap::new();
        for share in shares {
            let source = share.source.as_str();
            let destination = share.destination.as_str();

            let flavor = if destination == WILDCARD && source == ANY {
                Some(LinkFlavor::DestinationWildcard)
            } else if source == WILDCARD && destination == ANY {
                Some(LinkFlavor::SourceWildcard)
            } else if self.db.check_group_exists(source).await?
                || self.db.check_group_exists(destination).await?
            {
                if source != ANY && destination != ANY {
                    Some(LinkFlavor::GroupPair)
                } else if destination == ANY {
                    Some(LinkFlavor::SourceGroup)
                } else {
                    Some(LinkFlavor::DestinationGroup)
                }
            } else if source != ANY && destination != ANY {
                Some(LinkFlavor::SePair)
            } else if destination == ANY {
                Some(LinkFlavor::SourceSe)
            } else if source == ANY {
                Some(LinkFlavor::DestinationSe)
            } else {
                None
            };

            if let Some(flavor) = flavor {
                links.insert(flavor, (share.source.clone(), share.destination.clone()));
            }
        }
        Ok(links)
    }

    /// Fetch the link row named by a slot and map it onto a protocol.
    async fn link_protocol(
        &self,
        names: &(String, String),
    ) -> Result<Option<ResolvedProtocol>, CoreError> {
        let Some(link) = self.db.get_link_config(&names.0, &names.1).await? else {
            return Ok(None);
        };
        Ok(Some(ResolvedProtocol {
            nostreams: link.nostreams,
            buffer_size: link.tcp_buffer_size,
            timeout: link.urlcopy_timeout,
            auto_tuned: link.auto_tuning == "on",
        }))
    }

    /// First slot in `order` whose link row exists.
    async fn first_link(
        &self,
        links: &HashMap<LinkFlavor, (String, String)>,
        order: &[LinkFlavor],
    ) -> Result<Option<ResolvedProtocol>, CoreError> {
        for flavor in order {
            if let Some(names) = links.get(flavor)
                && let Some(protocol) = self.link_protocol(names).await?
            {
                return Ok(Some(protocol));
            }
        }
        Ok(None)
    }

    /// Combine standalone source and destination configurations.
    async fn merge(
        &self,
        file: &TransferFile,
        source: Option<ResolvedProtocol>,
        destination: Option<ResolvedProtocol>,
    ) -> Result<Option<ResolvedProtocol>, CoreError> {
        match (source, destination) {
            (None, None) => Ok(None),
            (Some(one), None) | (None, Some(one)) => Ok(Some(self.fill_auto(file, one).await?)),
            (Some(src), Some(dst)) => {
                let needs_auto = [
                    src.nostreams,
                    src.buffer_size,
                    src.timeout,
                    dst.nostreams,
                    dst.buffer_size,
                    dst.timeout,
                ]
                .contains(&AUTOMATIC);
                let tuned = if needs_auto {
                    Some(
                        self.db
                            .fetch_optimization_config(&file.source_se, &file.dest_se)
                            .await?,
                    )
                } else {
                    None
                };
                let tuned = tuned.unwrap_or_default();

                let (nostreams, streams_auto) =
                    merge_field(src.nostreams, dst.nostreams, tuned.nostreams);
                let (buffer_size, buffer_auto) =
                    merge_field(src.buffer_size, dst.buffer_size, tuned.buffer_size);
                let (timeout, timeout_auto) = merge_field(src.timeout, dst.timeout, tuned.timeout);

                Ok(Some(ResolvedProtocol {
                    nostreams,
                    buffer_size,
                    timeout,
                    auto_tuned: streams_auto
                        || buffer_auto
                        || timeout_auto
                        || src.auto_tuned
                        || dst.auto_tuned,
                }))
            }
        }
    }

    /// Substitute optimizer values for sentinel fields of a one-sided
    /// configuration.
    async fn fill_auto(
        &self,
        file: &TransferFile,
        mut protocol: ResolvedProtocol,
    ) -> Result<ResolvedProtocol, CoreError> {
        let needs_auto = [protocol.nostreams, protocol.buffer_size, protocol.timeout]
            .contains(&AUTOMATIC);
        if !needs_auto {
            return Ok(protocol);
        }

        let tuned = self
            .db
            .fetch_optimization_config(&file.source_se, &file.dest_se)
            .await?;
        if protocol.nostreams == AUTOMATIC {
            protocol.nostreams = tuned.nostreams;
        }
        if protocol.buffer_size == AUTOMATIC {
            protocol.buffer_size = tuned.buffer_size;
        }
        if protocol.timeout == AUTOMATIC {
            protocol.timeout = tuned.timeout;
        }
        protocol.auto_tuned = true;
        Ok(protocol)
    }
}

/// Merge one field across the two sides. The smaller value wins; a side
/// stored as the sentinel competes with its live optimizer value, and the
/// auto flag is reported only when that value is the one in effect.
fn merge_field(source: i32, destination: i32, auto_value: i32) -> (i32, bool) {
    match (source == AUTOMATIC, destination == AUTOMATIC) {
        (true, true) => (auto_value, true),
        (true, false) => {
            if auto_value < destination {
                (auto_value, true)
            } else {
                (destination, false)
            }
        }
        (false, true) => {
            if auto_value < source {
                (auto_value, true)
            } else {
                (source, false)
            }
        }
        (false, false) => (source.min(destination), false),
    }
}
