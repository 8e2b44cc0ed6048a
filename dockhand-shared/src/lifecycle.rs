use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// The nine lifecycle stages of a deployment, in canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEvent {
    BeforeBlockTraffic,
    AfterBlockTraffic,
    ApplicationStop,
    BeforeInstall,
    AfterInstall,
    ApplicationStart,
    BeforeAllowTraffic,
    AfterAllowTraffic,
    ValidateService,
}

/// Canonical event order. Hook commands arrive one at a time from the
/// service, but the local one-shot runner walks this list directly.
pub const ORDERED_EVENTS: [LifecycleEvent; 9] = [
    LifecycleEvent::BeforeBlockTraffic,
    LifecycleEvent::AfterBlockTraffic,
    LifecycleEvent::ApplicationStop,
    LifecycleEvent::BeforeInstall,
    LifecycleEvent::AfterInstall,
    LifecycleEvent::ApplicationStart,
    LifecycleEvent::BeforeAllowTraffic,
    LifecycleEvent::AfterAllowTraffic,
    LifecycleEvent::ValidateService,
];

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::BeforeBlockTraffic => "BeforeBlockTraffic",
            LifecycleEvent::AfterBlockTraffic => "AfterBlockTraffic",
            LifecycleEvent::ApplicationStop => "ApplicationStop",
            LifecycleEvent::BeforeInstall => "BeforeInstall",
            LifecycleEvent::AfterInstall => "AfterInstall",
            LifecycleEvent::ApplicationStart => "ApplicationStart",
            LifecycleEvent::BeforeAllowTraffic => "BeforeAllowTraffic",
            LifecycleEvent::AfterAllowTraffic => "AfterAllowTraffic",
            LifecycleEvent::ValidateService => "ValidateService",
        }
    }
}

impl Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LifecycleEvent {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ORDERED_EVENTS
            .iter()
            .find(|e| e.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown lifecycle event: {0}")]
pub struct UnknownEvent(pub String);

/// Which on-disk deployment archive a hook resolves its scripts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveRoot {
    /// The deployment currently being executed.
    Current,
    /// The deployment recorded by the last successful Install in the group.
    LastSuccessful,
    /// The deployment whose bundle was downloaded most recently.
    MostRecent,
}

/// Archive-root selection for an event.
///
/// The traffic/stop events run scripts from the previously installed
/// revision; everything else runs against the incoming one. During a
/// blue/green rollback the service replays traffic events against different
/// revisions, so the block-traffic pair shifts to the most recent download.
pub fn archive_root_for(event: LifecycleEvent, rollback: bool) -> ArchiveRoot {
    use LifecycleEvent::*;
    if rollback {
        return match event {
            BeforeBlockTraffic | AfterBlockTraffic => ArchiveRoot::MostRecent,
            ApplicationStop | BeforeAllowTraffic | AfterAllowTraffic => ArchiveRoot::LastSuccessful,
            BeforeInstall | AfterInstall | ApplicationStart | ValidateService => {
                ArchiveRoot::Current
            }
        };
    }
    match event {
        BeforeBlockTraffic | AfterBlockTraffic | ApplicationStop => ArchiveRoot::LastSuccessful,
        _ => ArchiveRoot::Current,
    }
}

/// Same selection keyed by raw event name. Names that do not parse fall back
/// to the current archive.
pub fn archive_root_for_name(event: &str, rollback: bool) -> ArchiveRoot {
    match event.parse::<LifecycleEvent>() {
        Ok(e) => archive_root_for(e, rollback),
        Err(_) => ArchiveRoot::Current,
    }
}

/// Lifecycle events a host command maps to. `DownloadBundle` and `Install`
/// are infrastructure commands routed elsewhere; every hook command maps to
/// the event of the same name. Unknown command names map to nothing so that
/// newer service-side commands degrade to a successful no-op.
pub fn events_for_command(command_name: &str) -> Option<Vec<LifecycleEvent>> {
    command_name
        .parse::<LifecycleEvent>()
        .ok()
        .map(|e| vec![e])
}
