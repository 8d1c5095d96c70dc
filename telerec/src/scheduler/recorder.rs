//! Capture session manager and control loop.
//!
//! A single owner task has exclusive ownership of the tuner table, the
//! session table, the current plan and the rebuild guard, and serves
//! requests over a command channel. That preserves single-writer
//! semantics without any lock discipline: a decision and the state change
//! it implies cannot interleave with anything else.
//!
//! Consumers multiplex onto capture sessions by reference count. External
//! consumers (live viewing) hold a [`SessionHandle`] that releases on
//! drop; the recording attachments held by the plan are released
//! explicitly by the owner task.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};

use super::plan::{build_plan, Class, RecordingCandidate, ScheduledRecording};
use super::SessionId;
use crate::capture::{recording_file_name, CaptureGraph, GraphError, GraphId, StartRequest};
use crate::config::ChannelMap;
use crate::database::{DatabaseError, DatabaseHandle};
use crate::text;
use crate::tuner::{select_tuner, AllocateError, Selection, TunerTable};

/// Control loop period: scheduled recordings start and stop on this tick.
pub const CONTROL_TICK_SECS: u64 = 60;

/// Teletext harvest rotation period.
pub const HARVEST_TICK_SECS: u64 = 180;

/// Recordings shorter than this are discarded, not persisted.
const MIN_RECORD_SECS: i64 = 5 * 60;

/// A channel whose EPG does not reach this far ahead gets harvested.
const HARVEST_HORIZON_HOURS: i64 = 24;

/// The plan covers `[now - 15 min, now + 24 h)`.
const PLAN_LOOKBACK_MINS: i64 = 15;
const PLAN_WINDOW_HOURS: i64 = 24;

/// What a consumer attaches to a session for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Recording,
    LiveView,
    /// EPG harvesting; lowest priority, always preemptable.
    Teletext,
}

/// Scheduler errors. None of these are fatal: allocation failures are
/// retried on the next control tick, short recordings are merely not
/// persisted.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(transparent)]
    Allocate(#[from] AllocateError),

    #[error("capture graph error: {0}")]
    Capture(#[from] GraphError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("recording of {channel} lasted {seconds}s, too short to keep")]
    TooShortToPersist { channel: String, seconds: i64 },

    #[error("recorder is not running")]
    Closed,
}

/// One physical capture: a tuner locked to a transponder with the
/// external graph running. Multiple consumers share it by refcount.
#[derive(Debug)]
struct CaptureSession {
    channel: String,
    tuner: String,
    transponder: u64,
    graph: GraphId,
    /// Output file; `None` for teletext-only harvesting captures.
    file: Option<PathBuf>,
    started_at: DateTime<Utc>,
    ref_count: u32,
    teletext_only: bool,
}

enum Command {
    RequestRecording {
        channel: String,
        at: DateTime<Utc>,
        priority: i32,
        reply: oneshot::Sender<Result<bool, RecorderError>>,
    },
    CancelRecording {
        channel: String,
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<bool, RecorderError>>,
    },
    CurrentPlan {
        reply: oneshot::Sender<Vec<ScheduledRecording>>,
    },
    LiveView {
        channel: String,
        reply: oneshot::Sender<Result<SessionHandle, RecorderError>>,
    },
    Release {
        session: SessionId,
        kind: SessionKind,
        since: DateTime<Utc>,
    },
    Rebuild,
    InstallPlan {
        candidates: Vec<RecordingCandidate>,
    },
    Harvest,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Client side of the recorder task.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RecorderHandle {
    /// Flag the programme at (`channel`, `at`) for recording with the
    /// given priority. Returns false when no such programme exists.
    pub async fn request_recording(
        &self,
        channel: &str,
        at: DateTime<Utc>,
        priority: i32,
    ) -> Result<bool, RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::RequestRecording {
                channel: channel.to_string(),
                at,
                priority,
                reply,
            })
            .map_err(|_| RecorderError::Closed)?;
        rx.await.map_err(|_| RecorderError::Closed)?
    }

    /// Remove the record flag from the programme at (`channel`, `at`).
    /// A recording already running is not interrupted.
    pub async fn cancel_recording(
        &self,
        channel: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CancelRecording {
                channel: channel.to_string(),
                at,
                reply,
            })
            .map_err(|_| RecorderError::Closed)?;
        rx.await.map_err(|_| RecorderError::Closed)?
    }

    /// The plan the control loop is realizing.
    pub async fn current_plan(&self) -> Result<Vec<ScheduledRecording>, RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CurrentPlan { reply })
            .map_err(|_| RecorderError::Closed)?;
        rx.await.map_err(|_| RecorderError::Closed)
    }

    /// Attach a live-viewing consumer to a channel. The returned handle
    /// releases the session when dropped.
    pub async fn live_view(&self, channel: &str) -> Result<SessionHandle, RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::LiveView {
                channel: channel.to_string(),
                reply,
            })
            .map_err(|_| RecorderError::Closed)?;
        rx.await.map_err(|_| RecorderError::Closed)?
    }

    /// Request a plan rebuild. A no-op while one is already in flight;
    /// the in-flight run reads current data anyway.
    pub fn rebuild(&self) {
        let _ = self.tx.send(Command::Rebuild);
    }

    /// Run a teletext harvest cycle outside the regular rotation.
    pub fn trigger_harvest(&self) {
        let _ = self.tx.send(Command::Harvest);
    }

    /// Stop every session and end the recorder task.
    pub async fn shutdown(&self) -> Result<(), RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .map_err(|_| RecorderError::Closed)?;
        rx.await.map_err(|_| RecorderError::Closed)
    }
}

/// An owned attachment to a capture session. Dropping the handle releases
/// the consumer; the session stops when its last consumer lets go.
pub struct SessionHandle {
    session: SessionId,
    channel: String,
    kind: SessionKind,
    since: DateTime<Utc>,
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Raw name of the channel this consumer asked for.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Release {
            session: self.session,
            kind: self.kind,
            since: self.since,
        });
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.session)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// The owner task state.
pub struct Recorder {
    map: Arc<ChannelMap>,
    db: DatabaseHandle,
    graph: Arc<dyn CaptureGraph>,
    recording_dir: PathBuf,
    tuners: TunerTable,
    sessions: HashMap<SessionId, CaptureSession>,
    plan: Vec<ScheduledRecording>,
    /// Single-flight guard for plan rebuilds.
    building: bool,
    next_session: SessionId,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Recorder {
    pub fn new(
        map: Arc<ChannelMap>,
        db: DatabaseHandle,
        graph: Arc<dyn CaptureGraph>,
        recording_dir: PathBuf,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tuners: TunerTable::new(&map),
            map,
            db,
            graph,
            recording_dir,
            sessions: HashMap::new(),
            plan: Vec::new(),
            building: false,
            next_session: 1,
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> RecorderHandle {
        RecorderHandle {
            tx: self.tx.clone(),
        }
    }

    /// Start the owner task. The first plan rebuild is triggered
    /// immediately; the control and harvest loops start one period in.
    pub fn spawn(self) -> (RecorderHandle, tokio::task::JoinHandle<()>) {
        let handle = self.handle();
        let join = tokio::spawn(self.run());
        (handle, join)
    }

    async fn run(mut self) {
        info!(
            "Recorder starting: control tick {}s, harvest tick {}s",
            CONTROL_TICK_SECS, HARVEST_TICK_SECS
        );
        self.trigger_rebuild();

        let control_period = StdDuration::from_secs(CONTROL_TICK_SECS);
        let harvest_period = StdDuration::from_secs(HARVEST_TICK_SECS);
        let mut control = interval_at(Instant::now() + control_period, control_period);
        let mut harvest = interval_at(Instant::now() + harvest_period, harvest_period);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = control.tick() => self.control_tick(Utc::now()).await,
                _ = harvest.tick() => self.harvest_tick(Utc::now()).await,
            }
        }

        info!("Recorder stopped");
    }

    /// Returns true when the task should end.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::RequestRecording {
                channel,
                at,
                priority,
                reply,
            } => {
                let _ = reply.send(self.set_priority(&channel, at, priority).await);
            }
            Command::CancelRecording { channel, at, reply } => {
                let _ = reply.send(self.set_priority(&channel, at, 0).await);
            }
            Command::CurrentPlan { reply } => {
                let _ = reply.send(self.plan.clone());
            }
            Command::LiveView { channel, reply } => {
                let since = Utc::now();
                let result = self
                    .acquire(&channel, SessionKind::LiveView, None)
                    .await
                    .map(|session| SessionHandle {
                        session,
                        channel: text::raw_name(&channel),
                        kind: SessionKind::LiveView,
                        since,
                        tx: self.tx.clone(),
                    });
                let _ = reply.send(result);
            }
            Command::Release {
                session,
                kind,
                since,
            } => self.release(session, kind, since).await,
            Command::Rebuild => self.trigger_rebuild(),
            Command::InstallPlan { candidates } => self.install_plan(candidates).await,
            Command::Harvest => self.harvest_tick(Utc::now()).await,
            Command::Shutdown { reply } => {
                self.stop_all().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    /// Update a programme's record priority and rebuild the plan.
    async fn set_priority(
        &mut self,
        channel: &str,
        at: DateTime<Utc>,
        priority: i32,
    ) -> Result<bool, RecorderError> {
        let raw = text::raw_name(channel);
        let changed = {
            let db = self.db.lock().await;
            db.set_record_priority(&raw, at, priority)?
        };

        if changed {
            self.trigger_rebuild();
        }
        Ok(changed)
    }

    /// The session already serving this channel, if any: a session whose
    /// tuner carries the channel on the transponder it is locked to.
    fn find_session(&self, raw_channel: &str) -> Option<SessionId> {
        self.sessions.iter().find_map(|(id, session)| {
            (session.transponder != 0
                && self.map.transponder_for(raw_channel, &session.tuner)
                    == Some(session.transponder))
            .then_some(*id)
        })
    }

    /// Attach a consumer to the channel's session, starting one if
    /// needed. Teletext harvesting never preempts anything; everything
    /// else preempts teletext harvesting.
    async fn acquire(
        &mut self,
        channel: &str,
        kind: SessionKind,
        preferred: Option<&str>,
    ) -> Result<SessionId, RecorderError> {
        let raw = text::raw_name(channel);

        if let Some(id) = self.find_session(&raw) {
            let teletext_only = self
                .sessions
                .get(&id)
                .map(|s| s.teletext_only)
                .unwrap_or(false);

            if teletext_only && kind != SessionKind::Teletext {
                // A harvesting capture records nothing; replace it with a
                // full capture rather than multiplexing onto it.
                info!("Replacing teletext capture on {} with a full capture", raw);
                self.stop_session(id).await;
            } else if let Some(session) = self.sessions.get_mut(&id) {
                session.ref_count += 1;
                debug!(
                    "Sharing session {} for {} (consumers: {})",
                    id, raw, session.ref_count
                );
                return Ok(id);
            }
        }

        loop {
            let sessions = &self.sessions;
            let teletext_only =
                |tuner: &str| sessions.values().any(|s| s.tuner == tuner && s.teletext_only);

            let selection = select_tuner(
                &self.tuners,
                &self.map,
                &raw,
                preferred,
                kind != SessionKind::Teletext,
                &teletext_only,
            )?;

            match selection {
                Selection::PreemptTeletext { tuner } => {
                    let squatters: Vec<SessionId> = self
                        .sessions
                        .iter()
                        .filter(|(_, s)| s.tuner == tuner && s.teletext_only)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in squatters {
                        info!("Preempting teletext capture {} on tuner {}", id, tuner);
                        self.stop_session(id).await;
                    }
                }
                Selection::Lock {
                    tuner,
                    transponder,
                    service_id,
                }
                | Selection::Share {
                    tuner,
                    transponder,
                    service_id,
                } => {
                    return self
                        .start_session(&raw, &tuner, transponder, service_id, kind)
                        .await;
                }
            }
        }
    }

    async fn start_session(
        &mut self,
        raw_channel: &str,
        tuner: &str,
        transponder: u64,
        service_id: u64,
        kind: SessionKind,
    ) -> Result<SessionId, RecorderError> {
        let started_at = Utc::now();
        let teletext_only = kind == SessionKind::Teletext;
        let file = (!teletext_only).then(|| {
            self.recording_dir
                .join(recording_file_name(raw_channel, started_at))
        });

        let request = StartRequest {
            tuner: tuner.to_string(),
            channel: raw_channel.to_string(),
            transponder,
            service_id,
            file: file.clone(),
        };
        let graph = self.graph.start(&request)?;

        self.tuners.attach(tuner, transponder);

        let id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(
            id,
            CaptureSession {
                channel: raw_channel.to_string(),
                tuner: tuner.to_string(),
                transponder,
                graph,
                file,
                started_at,
                ref_count: 1,
                teletext_only,
            },
        );

        info!(
            "Started {} session {} for {} on tuner {} (transponder {})",
            if teletext_only { "teletext" } else { "capture" },
            id,
            raw_channel,
            tuner,
            transponder
        );
        Ok(id)
    }

    /// Detach one consumer; the session stops at refcount zero. Live
    /// viewing leaves a viewing-history interval behind.
    async fn release(&mut self, session: SessionId, kind: SessionKind, since: DateTime<Utc>) {
        if kind == SessionKind::LiveView {
            if let Some(s) = self.sessions.get(&session) {
                let channel = s.channel.clone();
                let db = self.db.lock().await;
                if let Err(e) = db.store_view(&channel, since, Utc::now()) {
                    error!("Failed to persist view history for {}: {}", channel, e);
                }
            }
        }

        let Some(s) = self.sessions.get_mut(&session) else {
            // Already stopped, e.g. a preempted teletext capture.
            return;
        };
        s.ref_count = s.ref_count.saturating_sub(1);
        debug!(
            "Released session {} ({} consumers left)",
            session, s.ref_count
        );
        if s.ref_count == 0 {
            self.stop_session(session).await;
        }
    }

    /// Stop the capture, unlock the tuner and persist the recording
    /// interval (unless it is too short to be useful).
    async fn stop_session(&mut self, id: SessionId) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };

        self.graph.stop(session.graph);
        self.tuners.detach(&session.tuner);
        info!("Stopped session {} for {}", id, session.channel);

        if let Err(e) = self.persist_recording(&session).await {
            match e {
                RecorderError::TooShortToPersist { .. } => info!("{}", e),
                e => error!("{}", e),
            }
        }

        for entry in &mut self.plan {
            if entry.session == Some(id) {
                entry.session = None;
            }
        }
    }

    async fn persist_recording(&self, session: &CaptureSession) -> Result<(), RecorderError> {
        let Some(file) = &session.file else {
            return Ok(()); // nothing recorded by teletext captures
        };

        let now = Utc::now();
        let seconds = (now - session.started_at).num_seconds();
        if seconds < MIN_RECORD_SECS {
            return Err(RecorderError::TooShortToPersist {
                channel: session.channel.clone(),
                seconds,
            });
        }

        let db = self.db.lock().await;
        db.store_record(
            &session.channel,
            &file.to_string_lossy(),
            session.started_at,
            now,
        )?;
        Ok(())
    }

    /// Dispatch a plan rebuild unless one is already in flight. The EPG
    /// scan runs off the owner task; only the resulting candidate set
    /// comes back here for conflict resolution and the atomic swap.
    fn trigger_rebuild(&mut self) {
        if self.building {
            debug!("Plan rebuild already in flight; request dropped");
            return;
        }
        self.building = true;

        let db = self.db.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let candidates = collect_candidates(db).await;
            let _ = tx.send(Command::InstallPlan { candidates });
        });
    }

    /// Resolve conflicts and swap in the new plan. Sessions backing
    /// current plan entries join as unbeatable candidates, so a running
    /// recording is never preempted; sessions the new plan no longer
    /// references lose their recording consumer.
    async fn install_plan(&mut self, mut candidates: Vec<RecordingCandidate>) {
        self.building = false;

        let mut seq = candidates.len();
        for entry in &self.plan {
            let Some(id) = entry.session else { continue };
            if !self.sessions.contains_key(&id) {
                continue;
            }
            candidates.push(RecordingCandidate {
                channel: entry.channel.clone(),
                name: entry.name.clone(),
                begin: entry.begin,
                end: entry.end,
                class: Class::Running,
                seq,
                tuner: Some(entry.tuner.clone()),
                scheduled: true,
                session: Some(id),
            });
            seq += 1;
        }

        let old_sessions: HashSet<SessionId> =
            self.plan.iter().filter_map(|e| e.session).collect();

        let new_plan = build_plan(candidates, &self.map);

        let new_sessions: HashSet<SessionId> =
            new_plan.iter().filter_map(|e| e.session).collect();
        for id in old_sessions.difference(&new_sessions) {
            self.release(*id, SessionKind::Recording, Utc::now()).await;
        }

        for entry in &new_plan {
            debug!(
                "Scheduled recording {:?} on {} via {}: {} - {}",
                entry.name, entry.channel, entry.tuner, entry.begin, entry.end
            );
        }
        self.plan = new_plan;
    }

    /// One pass of the control loop: release finished recordings, start
    /// due ones. Start failures are logged and retried next tick; a
    /// competing session may have ended by then.
    async fn control_tick(&mut self, now: DateTime<Utc>) {
        let mut remaining = Vec::with_capacity(self.plan.len());
        for entry in std::mem::take(&mut self.plan) {
            if entry.end < now {
                if let Some(id) = entry.session {
                    info!("Finished recording {:?} on {}", entry.name, entry.channel);
                    self.release(id, SessionKind::Recording, entry.begin).await;
                }
            } else {
                remaining.push(entry);
            }
        }

        for entry in &mut remaining {
            if entry.begin > now || entry.session.is_some() {
                continue;
            }

            let channel = entry.channel.clone();
            let tuner = entry.tuner.clone();
            match self
                .acquire(&channel, SessionKind::Recording, Some(&tuner))
                .await
            {
                Ok(id) => {
                    info!("Started recording {:?} on {}", entry.name, entry.channel);
                    entry.session = Some(id);
                }
                Err(e) => {
                    warn!(
                        "Could not start recording {:?} on {}: {} (will retry)",
                        entry.name, entry.channel, e
                    );
                }
            }
        }

        self.plan = remaining;
    }

    /// One teletext harvest cycle: stop the previous round of harvesting
    /// captures, then start captures for channels whose EPG data has gone
    /// stale. When a cycle winds down without starting new captures, the
    /// freshly harvested EPG data may change the plan.
    async fn harvest_tick(&mut self, now: DateTime<Utc>) {
        let previous: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.teletext_only)
            .map(|(id, _)| *id)
            .collect();

        let mut rested: HashSet<String> = HashSet::new();
        for id in &previous {
            if let Some(s) = self.sessions.get(id) {
                rested.insert(s.channel.clone());
            }
            self.stop_session(*id).await;
        }

        let horizon = now + Duration::hours(HARVEST_HORIZON_HOURS);
        let channels: Vec<String> = self
            .map
            .channels()
            .iter()
            .map(|c| c.raw_name.clone())
            .collect();

        let mut started = false;
        for raw in channels {
            if rested.contains(&raw) {
                continue;
            }
            // A running full capture harvests teletext as a side effect.
            if self.find_session(&raw).is_some() {
                continue;
            }

            let stale = {
                let db = self.db.lock().await;
                match db.next_programme(&raw, horizon) {
                    Ok(next) => next.is_none(),
                    Err(e) => {
                        warn!("EPG staleness check for {} failed: {}", raw, e);
                        false
                    }
                }
            };
            if !stale {
                continue;
            }

            match self.acquire(&raw, SessionKind::Teletext, None).await {
                Ok(_) => started = true,
                Err(RecorderError::Allocate(e)) => {
                    debug!("Teletext harvest for {} postponed: {}", raw, e)
                }
                Err(e) => warn!("Teletext harvest for {} failed: {}", raw, e),
            }
        }

        if !started && !previous.is_empty() {
            self.trigger_rebuild();
        }
    }

    async fn stop_all(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.stop_session(id).await;
        }
    }
}

/// Collect recording candidates from the EPG store: flagged programmes in
/// the plan window, each bounded by the next programme on its channel.
/// Database failures degrade to an empty candidate set; running sessions
/// are protected separately, so a transient read error cannot kill a
/// recording in progress.
async fn collect_candidates(db: DatabaseHandle) -> Vec<RecordingCandidate> {
    let now = Utc::now();
    let begin = now - Duration::minutes(PLAN_LOOKBACK_MINS);
    let end = begin + Duration::hours(PLAN_WINDOW_HOURS);

    let db = db.lock().await;
    let programmes = match db.programmes_to_record(begin, end) {
        Ok(programmes) => programmes,
        Err(e) => {
            warn!("EPG scan failed, treating as empty: {}", e);
            Vec::new()
        }
    };

    let mut candidates = Vec::new();
    for programme in programmes {
        match db.next_programme(&programme.channel, programme.utc_start) {
            Ok(Some(next)) if next.utc_start > programme.utc_start => {
                let seq = candidates.len();
                candidates.push(RecordingCandidate::from_programme(
                    &programme,
                    next.utc_start,
                    seq,
                ));
            }
            Ok(_) => debug!(
                "Skipping {:?} on {}: nothing follows it to bound the recording",
                programme.name, programme.channel
            ),
            Err(e) => warn!(
                "Next-programme lookup for {} failed: {}",
                programme.channel, e
            ),
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::database::{Database, NewProgramme};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockGraph {
        starts: Mutex<Vec<StartRequest>>,
        stops: Mutex<Vec<GraphId>>,
        next: AtomicU64,
    }

    impl MockGraph {
        fn start_count(&self) -> usize {
            self.starts.lock().unwrap().len()
        }

        fn stop_count(&self) -> usize {
            self.stops.lock().unwrap().len()
        }
    }

    impl CaptureGraph for MockGraph {
        fn start(&self, request: &StartRequest) -> Result<GraphId, GraphError> {
            self.starts.lock().unwrap().push(request.clone());
            Ok(self.next.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn stop(&self, id: GraphId) {
            self.stops.lock().unwrap().push(id);
        }
    }

    fn test_map() -> Arc<ChannelMap> {
        Arc::new(ChannelMap::new(
            &Config::from_toml(
                r#"
                [[tuners]]
                name = "a"

                [[channels]]
                name = "X"
                preset = 1
                feeds = [{ tuner = "a", transponder = 474, service_id = 1 }]

                [[channels]]
                name = "Y"
                preset = 2
                feeds = [{ tuner = "a", transponder = 474, service_id = 2 }]

                [[channels]]
                name = "Z"
                preset = 3
                feeds = [{ tuner = "a", transponder = 482, service_id = 3 }]
                "#,
            )
            .unwrap(),
        ))
    }

    fn test_recorder() -> (Recorder, Arc<MockGraph>, DatabaseHandle) {
        let graph = Arc::new(MockGraph::default());
        let db: DatabaseHandle = Arc::new(tokio::sync::Mutex::new(
            Database::open_in_memory().unwrap(),
        ));
        let recorder = Recorder::new(
            test_map(),
            db.clone(),
            graph.clone(),
            PathBuf::from("/tmp/telerec-test"),
        );
        (recorder, graph, db)
    }

    #[tokio::test]
    async fn refcount_gives_one_start_and_one_stop() {
        let (mut r, graph, _db) = test_recorder();

        let s1 = r.acquire("X", SessionKind::LiveView, None).await.unwrap();
        let s2 = r.acquire("X", SessionKind::LiveView, None).await.unwrap();
        let s3 = r.acquire("X", SessionKind::LiveView, None).await.unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s2, s3);
        assert_eq!(graph.start_count(), 1);

        let since = Utc::now();
        r.release(s1, SessionKind::LiveView, since).await;
        r.release(s2, SessionKind::LiveView, since).await;
        assert_eq!(graph.stop_count(), 0);

        r.release(s3, SessionKind::LiveView, since).await;
        assert_eq!(graph.stop_count(), 1);
        assert!(r.sessions.is_empty());
        assert_eq!(r.tuners.get("a").unwrap().locked_transponder, 0);
    }

    #[tokio::test]
    async fn channels_on_one_transponder_share_a_session() {
        let (mut r, graph, _db) = test_recorder();

        let x = r.acquire("X", SessionKind::LiveView, None).await.unwrap();
        let y = r.acquire("Y", SessionKind::LiveView, None).await.unwrap();

        assert_eq!(x, y);
        assert_eq!(graph.start_count(), 1);
        assert_eq!(r.sessions[&x].ref_count, 2);
    }

    #[tokio::test]
    async fn incompatible_transponder_reports_busy() {
        let (mut r, _graph, _db) = test_recorder();

        r.acquire("X", SessionKind::LiveView, None).await.unwrap();
        let err = r.acquire("Z", SessionKind::LiveView, None).await.unwrap_err();
        assert!(matches!(
            err,
            RecorderError::Allocate(AllocateError::TunerBusy(_))
        ));
    }

    #[tokio::test]
    async fn teletext_capture_is_preempted_by_a_real_consumer() {
        let (mut r, graph, _db) = test_recorder();

        let tt = r.acquire("Z", SessionKind::Teletext, None).await.unwrap();
        assert!(r.sessions[&tt].file.is_none());

        // X lives on another transponder; the harvest must make way.
        let x = r.acquire("X", SessionKind::Recording, None).await.unwrap();
        assert!(!r.sessions.contains_key(&tt));
        assert!(r.sessions[&x].file.is_some());
        assert_eq!(graph.start_count(), 2);
        assert_eq!(graph.stop_count(), 1);
    }

    #[tokio::test]
    async fn teletext_session_upgrades_for_a_recording_on_its_own_channel() {
        let (mut r, graph, _db) = test_recorder();

        let tt = r.acquire("X", SessionKind::Teletext, None).await.unwrap();
        let full = r.acquire("X", SessionKind::Recording, None).await.unwrap();

        assert_ne!(tt, full);
        assert!(!r.sessions.contains_key(&tt));
        assert!(r.sessions[&full].file.is_some());
        assert_eq!(graph.start_count(), 2);
        assert_eq!(graph.stop_count(), 1);
    }

    #[tokio::test]
    async fn short_recordings_are_discarded_and_long_ones_persisted() {
        let (mut r, _graph, db) = test_recorder();

        // Too short: stopped right after starting.
        let short = r.acquire("X", SessionKind::Recording, None).await.unwrap();
        r.release(short, SessionKind::Recording, Utc::now()).await;

        // Long enough: pretend it has run for ten minutes.
        let long = r.acquire("X", SessionKind::Recording, None).await.unwrap();
        r.sessions.get_mut(&long).unwrap().started_at = Utc::now() - Duration::minutes(10);
        r.release(long, SessionKind::Recording, Utc::now()).await;

        let records = {
            let db = db.lock().await;
            db.records_between(
                "X",
                Utc::now() - Duration::hours(1),
                Utc::now() + Duration::hours(1),
            )
            .unwrap()
        };
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn live_view_release_stores_view_history() {
        let (mut r, _graph, db) = test_recorder();

        let since = Utc::now() - Duration::minutes(20);
        let id = r.acquire("X", SessionKind::LiveView, None).await.unwrap();
        r.release(id, SessionKind::LiveView, since).await;

        let views = {
            let db = db.lock().await;
            db.views_between(
                "X",
                since - Duration::minutes(1),
                Utc::now() + Duration::minutes(1),
            )
            .unwrap()
        };
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].begin, since);
    }

    #[tokio::test]
    async fn control_tick_starts_due_recordings_and_stops_finished_ones() {
        let (mut r, graph, _db) = test_recorder();
        let now = Utc::now();

        r.install_plan(vec![RecordingCandidate {
            channel: "X".into(),
            name: "News".into(),
            begin: now - Duration::minutes(1),
            end: now + Duration::minutes(30),
            class: Class::Planned { priority: 1 },
            seq: 0,
            tuner: None,
            scheduled: true,
            session: None,
        }])
        .await;
        assert_eq!(r.plan.len(), 1);

        r.control_tick(now).await;
        assert_eq!(graph.start_count(), 1);
        assert!(r.plan[0].session.is_some());

        // Once the end passes, the entry is released and removed.
        r.control_tick(now + Duration::minutes(31)).await;
        assert_eq!(graph.stop_count(), 1);
        assert!(r.plan.is_empty());
    }

    #[tokio::test]
    async fn allocation_failure_is_retried_not_fatal() {
        let (mut r, graph, _db) = test_recorder();
        let now = Utc::now();

        // Z's only tuner is pinned to another transponder by a viewer.
        let viewer = r.acquire("X", SessionKind::LiveView, None).await.unwrap();

        r.install_plan(vec![RecordingCandidate {
            channel: "Z".into(),
            name: "Film".into(),
            begin: now,
            end: now + Duration::hours(1),
            class: Class::Planned { priority: 1 },
            seq: 0,
            tuner: None,
            scheduled: true,
            session: None,
        }])
        .await;

        r.control_tick(now).await;
        assert!(r.plan[0].session.is_none());

        // The viewer leaves; the next tick succeeds.
        r.release(viewer, SessionKind::LiveView, now).await;
        r.control_tick(now + Duration::minutes(1)).await;
        assert!(r.plan[0].session.is_some());
        assert_eq!(graph.start_count(), 2);
    }

    #[tokio::test]
    async fn running_recording_survives_a_rebuild_without_its_programme() {
        let (mut r, graph, _db) = test_recorder();
        let now = Utc::now();

        r.install_plan(vec![RecordingCandidate {
            channel: "X".into(),
            name: "News".into(),
            begin: now - Duration::minutes(1),
            end: now + Duration::minutes(30),
            class: Class::Planned { priority: 1 },
            seq: 0,
            tuner: None,
            scheduled: true,
            session: None,
        }])
        .await;
        r.control_tick(now).await;
        let session = r.plan[0].session.unwrap();

        // The flag was cancelled: the rebuild sees no candidates, but the
        // running session joins as an unbeatable candidate of its own.
        r.install_plan(Vec::new()).await;

        assert_eq!(r.plan.len(), 1);
        assert_eq!(r.plan[0].session, Some(session));
        assert_eq!(graph.stop_count(), 0);
    }

    #[tokio::test]
    async fn rebuild_is_single_flight() {
        let (mut r, _graph, _db) = test_recorder();

        r.building = true;
        r.trigger_rebuild();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(
            r.rx.try_recv().is_err(),
            "no rebuild may be dispatched while one is in flight"
        );

        r.building = false;
        r.trigger_rebuild();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(matches!(
            r.rx.try_recv(),
            Ok(Command::InstallPlan { .. })
        ));
    }

    #[tokio::test]
    async fn harvest_targets_stale_channels_only() {
        let (mut r, graph, db) = test_recorder();
        let now = Utc::now();

        // X has EPG data two days out; Y and Z have nothing.
        {
            let db = db.lock().await;
            db.add_programme(NewProgramme::new("X", "News").at(now + Duration::hours(48)))
                .unwrap();
        }

        r.harvest_tick(now).await;

        let harvested: HashSet<String> = r
            .sessions
            .values()
            .filter(|s| s.teletext_only)
            .map(|s| s.channel.clone())
            .collect();
        // Y and Z share no transponder, and there is one tuner: only one
        // of them can be harvested this cycle; X is fresh and skipped.
        assert!(!harvested.contains("X"));
        assert_eq!(harvested.len(), 1);
        assert_eq!(graph.start_count(), 1);
    }

    #[tokio::test]
    async fn session_handles_release_on_drop() {
        let (recorder, graph, _db) = test_recorder();
        let (handle, join) = recorder.spawn();

        let view1 = handle.live_view("X").await.unwrap();
        let view2 = handle.live_view("X").await.unwrap();
        assert_eq!(view1.session(), view2.session());
        assert_eq!(view1.channel(), "X");
        assert_eq!(graph.start_count(), 1);

        drop(view1);
        drop(view2);
        // The queue is ordered: once this round-trips, the releases ran.
        handle.current_plan().await.unwrap();
        assert_eq!(graph.stop_count(), 1);

        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert!(handle.current_plan().await.is_err());
    }

    #[tokio::test]
    async fn request_recording_flags_programme_and_rebuilds() {
        let (recorder, graph, db) = test_recorder();
        let now = Utc::now();

        {
            let db = db.lock().await;
            db.add_programme(NewProgramme::new("X", "News").at(now - Duration::minutes(5)))
                .unwrap();
            db.add_programme(NewProgramme::new("X", "Weather").at(now + Duration::minutes(25)))
                .unwrap();
        }

        let (handle, join) = recorder.spawn();
        // Let the startup rebuild finish so ours is not coalesced into it.
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert!(handle
            .request_recording("X", now - Duration::minutes(5), 2)
            .await
            .unwrap());
        // Unknown programme key changes nothing.
        assert!(!handle
            .request_recording("X", now - Duration::hours(7), 2)
            .await
            .unwrap());

        // Let the rebuild worker deliver its candidates.
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let plan = handle.current_plan().await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].channel, "X");
        assert_eq!(plan[0].tuner, "a");

        assert!(handle
            .cancel_recording("X", now - Duration::minutes(5))
            .await
            .unwrap());
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(handle.current_plan().await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert_eq!(graph.start_count(), 0);
    }
}
