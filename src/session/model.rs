use std::collections::BTreeMap;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Current wall time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Epoch ms `secs` after `now`; `None` unless finite and representable
pub fn start_after(now: i64, secs: f64) -> Option<i64> {
    let delta = (secs * 1000.0).round();
    if !delta.is_finite() || delta.abs() >= i64::MAX as f64 {
        return None;
    }
    now.checked_add(delta as i64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub joined_at_ms: i64,
}

impl Participant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            joined_at_ms: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Joined,
    Left,
    Triggered,
    Uploaded,
    Finished,
}

/// Entry of the append-only session log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    pub at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SessionEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            participant: None,
            at_ms: now_ms(),
            detail: None,
        }
    }

    pub fn by(mut self, participant: impl Into<String>) -> Self {
        self.participant = Some(participant.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Persisted session document shared by all participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDoc {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Recording round; a new generation may be scheduled again
    pub generation: u32,
    /// Start instant on the reference clock (epoch ms)
    #[serde(default)]
    pub scheduled_start_ms: Option<i64>,
    #[serde(default)]
    pub participants: BTreeMap<String, Participant>,
    #[serde(default)]
    pub events: Vec<SessionEvent>,
    pub created_at_ms: i64,
}

impl SessionDoc {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            generation: 1,
            scheduled_start_ms: None,
            participants: BTreeMap::new(),
            events: vec![SessionEvent::new(EventKind::Created)],
            created_at_ms: now_ms(),
        }
    }

    pub fn scheduled(mut self, start_ms: i64) -> Self {
        self.scheduled_start_ms = Some(start_ms);
        self
    }

    /// Name used in artifact paths
    pub fn slug(&self) -> String {
        slugify(self.name.as_deref().unwrap_or(&self.id))
    }

    /// Apply a partial update
    ///
    /// The scheduled start may be set once per generation; setting the same
    /// value again is a no-op.
    pub fn apply(&mut self, patch: &SessionPatch) -> EngineResult<()> {
        if patch.rearm {
            self.generation += 1;
            self.scheduled_start_ms = None;
        }

        if let Some(start) = patch.scheduled_start_ms {
            match self.scheduled_start_ms {
                Some(existing) if existing != start => {
                    return Err(EngineError::ScheduleLocked {
                        id: self.id.clone(),
                        generation: self.generation,
                    })
                }
                _ => self.scheduled_start_ms = Some(start),
            }
        }

        if let Some(name) = &patch.name {
            self.name = Some(name.clone());
        }

        if let Some(participant) = &patch.join {
            self.participants
                .insert(participant.id.clone(), participant.clone());
        }

        if let Some(id) = &patch.leave {
            self.participants.remove(id);
        }

        Ok(())
    }
}

/// Partial update of a [`SessionDoc`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub scheduled_start_ms: Option<i64>,
    pub join: Option<Participant>,
    pub leave: Option<String>,
    #[serde(default)]
    pub rearm: bool,
}

impl SessionPatch {
    pub fn schedule(start_ms: i64) -> Self {
        Self {
            scheduled_start_ms: Some(start_ms),
            ..Default::default()
        }
    }

    pub fn join(participant: Participant) -> Self {
        Self {
            join: Some(participant),
            ..Default::default()
        }
    }

    pub fn leave(participant: impl Into<String>) -> Self {
        Self {
            leave: Some(participant.into()),
            ..Default::default()
        }
    }

    pub fn rearm() -> Self {
        Self {
            rearm: true,
            ..Default::default()
        }
    }
}

/// Lower-case, with anything outside `[a-z0-9-]` replaced by `-`
pub fn slugify(value: &str) -> String {
    let slug: String = value
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    if slug.is_empty() {
        "session".to_string()
    } else {
        slug
    }
}

/// `{slug}_{participant}_{YYYY-MM-DD}_{HH:MM}.wav`
pub fn artifact_name(session_slug: &str, participant: &str, local_time: NaiveDateTime) -> String {
    format!(
        "{}_{}_{}_{}.wav",
        slugify(session_slug),
        slugify(participant),
        local_time.format("%Y-%m-%d"),
        local_time.format("%H:%M")
    )
}
