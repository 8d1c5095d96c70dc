//! Tuner table and allocation.
//!
//! A tuner is locked to at most one transponder at a time; every channel
//! on that transponder can be served by the same physical capture. The
//! allocation walk tries the tuners configured for a channel in
//! preference order and reports what the caller should do: lock a free
//! tuner, share an already-locked one, or first preempt a teletext-only
//! capture that is squatting on the tuner.
//!
//! Selection is read-only; the session manager owns all mutation so the
//! decision and the state change cannot race.

use log::debug;
use thiserror::Error;

use crate::config::ChannelMap;

/// Allocation errors.
#[derive(Debug, Error)]
pub enum AllocateError {
    /// No tuner is configured to receive the channel at all.
    #[error("no capable tuner configured for channel {0}")]
    NoCapableTuner(String),

    /// Every capable tuner is locked to an incompatible transponder.
    #[error("all tuners capable of channel {0} are busy")]
    TunerBusy(String),
}

/// A physical tuner and its lock state.
#[derive(Debug, Clone)]
pub struct Tuner {
    pub name: String,
    /// Preference rank from configuration; lower is tried first.
    pub rank: usize,
    /// Transponder this tuner is locked to; 0 means free.
    pub locked_transponder: u64,
    /// Number of capture sessions attached. Non-zero iff locked.
    pub ref_count: u32,
}

/// The table of physical tuners, in preference order.
#[derive(Debug, Default)]
pub struct TunerTable {
    tuners: Vec<Tuner>,
}

impl TunerTable {
    /// Build the table from configuration, one entry per ranked tuner.
    pub fn new(map: &ChannelMap) -> Self {
        let tuners = map
            .ranked_tuners()
            .iter()
            .enumerate()
            .map(|(rank, name)| Tuner {
                name: name.clone(),
                rank,
                locked_transponder: 0,
                ref_count: 0,
            })
            .collect();
        Self { tuners }
    }

    pub fn get(&self, name: &str) -> Option<&Tuner> {
        self.tuners.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tuner> {
        self.tuners.iter()
    }

    /// Attach a session: locks the transponder on the first attach.
    pub fn attach(&mut self, name: &str, transponder: u64) {
        if let Some(tuner) = self.tuners.iter_mut().find(|t| t.name == name) {
            if tuner.ref_count == 0 {
                debug!("Locking tuner {} to transponder {}", name, transponder);
                tuner.locked_transponder = transponder;
            }
            tuner.ref_count += 1;
        }
    }

    /// Detach a session: unlocks the transponder on the last detach.
    pub fn detach(&mut self, name: &str) {
        if let Some(tuner) = self.tuners.iter_mut().find(|t| t.name == name) {
            tuner.ref_count = tuner.ref_count.saturating_sub(1);
            if tuner.ref_count == 0 {
                debug!("Unlocking tuner {}", name);
                tuner.locked_transponder = 0;
            }
        }
    }
}

/// What the caller should do with the selected tuner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The tuner is free: lock it to the transponder and start a capture.
    Lock {
        tuner: String,
        transponder: u64,
        service_id: u64,
    },
    /// The tuner is already locked to the transponder the channel needs:
    /// attach to the existing capture.
    Share {
        tuner: String,
        transponder: u64,
        service_id: u64,
    },
    /// The tuner only carries a teletext harvesting capture on another
    /// transponder: stop it, then retry the selection.
    PreemptTeletext { tuner: String },
}

/// Pick a tuner able to serve `channel`.
///
/// Candidates are the channel's configured feeds in tuner preference
/// order, optionally narrowed to `preferred`. `teletext_only` reports
/// whether a tuner currently carries nothing but a teletext harvesting
/// capture; such a tuner is preemptable when `preempt_teletext` is set
/// and it sits on the wrong transponder.
pub fn select_tuner(
    table: &TunerTable,
    map: &ChannelMap,
    channel: &str,
    preferred: Option<&str>,
    preempt_teletext: bool,
    teletext_only: &dyn Fn(&str) -> bool,
) -> Result<Selection, AllocateError> {
    let mut candidates = 0;

    for feed in map.feeds_for(channel) {
        if let Some(preferred) = preferred {
            if feed.tuner != preferred {
                continue;
            }
        }

        let Some(tuner) = table.get(&feed.tuner) else {
            continue;
        };
        candidates += 1;

        // Teletext harvesting is the lowest-priority consumer: it never
        // keeps a real capture off the tuner.
        if preempt_teletext
            && tuner.locked_transponder != 0
            && tuner.locked_transponder != feed.transponder
            && teletext_only(&tuner.name)
        {
            return Ok(Selection::PreemptTeletext {
                tuner: tuner.name.clone(),
            });
        }

        if tuner.locked_transponder == 0 {
            return Ok(Selection::Lock {
                tuner: tuner.name.clone(),
                transponder: feed.transponder,
                service_id: feed.service_id,
            });
        }

        if tuner.locked_transponder == feed.transponder {
            return Ok(Selection::Share {
                tuner: tuner.name.clone(),
                transponder: feed.transponder,
                service_id: feed.service_id,
            });
        }

        // Busy on an incompatible transponder.
    }

    if candidates == 0 {
        Err(AllocateError::NoCapableTuner(channel.to_string()))
    } else {
        Err(AllocateError::TunerBusy(channel.to_string()))
    }
}
