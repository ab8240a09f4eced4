use std::collections::{BTreeMap, HashSet, VecDeque};
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout_at;
use tokio_util::sync::CancellationToken;

use cloud_gax::grpc::metadata::{Ascii, MetadataMap, MetadataValue};
use cloud_gax::grpc::Status;
use cloud_gax::retry::TryAs;

use crate::apiv1::conn_pool::ConnectionManager;
use crate::apiv1::rpc::{BatchCreateSessionsRequest, DeleteSessionRequest, Session};
use crate::apiv1::spanner_client::{ping_query_request, Client};
use crate::retry::is_session_not_found;

/// BatchCreateSessions never returns more than this many sessions per call.
const MAX_BATCH_CREATE_COUNT: usize = 100;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Session
pub struct SessionHandle {
    pub session: Session,
    pub spanner_client: Client,
    pool_id: u64,
    valid: bool,
    deleted: bool,
    last_used_at: Instant,
    last_checked_at: Instant,
    last_pong_at: Instant,
    created_at: Instant,
}

impl SessionHandle {
    pub(crate) fn new(session: Session, spanner_client: Client, pool_id: u64, now: Instant) -> SessionHandle {
        SessionHandle {
            session,
            spanner_client,
            pool_id,
            valid: true,
            deleted: false,
            last_used_at: now,
            last_checked_at: now,
            last_pong_at: now,
            created_at: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.session.name
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn last_checked_at(&self) -> Instant {
        self.last_checked_at
    }

    fn idle_since(&self) -> Instant {
        std::cmp::max(self.last_used_at, self.last_pong_at)
    }

    pub async fn invalidate_if_needed<T>(&mut self, arg: Result<T, Status>) -> Result<T, Status> {
        match arg {
            Ok(s) => Ok(s),
            Err(e) => {
                if is_session_not_found(&e) {
                    tracing::debug!("session invalidate {}", self.session.name);
                    self.delete().await;
                }
                Err(e)
            }
        }
    }

    async fn ping(&mut self, now: Instant) -> Result<(), Status> {
        let request = ping_query_request(self.session.name.clone());
        self.spanner_client.execute_sql(request, None).await?;
        self.last_checked_at = now;
        self.last_pong_at = now;
        Ok(())
    }

    /// Deletes the session on the server. The handle is invalid afterwards.
    pub async fn delete(&mut self) {
        self.valid = false;
        if self.deleted {
            return;
        }
        let session_name = &self.session.name;
        let request = DeleteSessionRequest {
            name: session_name.to_string(),
        };
        match self.spanner_client.delete_session(request, None).await {
            Ok(_) => self.deleted = true,
            Err(e) => tracing::error!("failed to delete session {}, {:?}", session_name, e),
        };
    }
}

/// A session checked out of the pool. Dropping it checks the session back in.
pub struct ManagedSession {
    session_pool: SessionPool,
    session: Option<SessionHandle>,
}

impl ManagedSession {
    fn new(session_pool: SessionPool, session: SessionHandle) -> Self {
        ManagedSession {
            session_pool,
            session: Some(session),
        }
    }

    pub fn pool_id(&self) -> u64 {
        self.session_pool.id
    }

    fn into_handle(mut self) -> Option<SessionHandle> {
        self.session.take()
    }
}

impl Drop for ManagedSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.session_pool.recycle(session);
        }
    }
}

impl Deref for ManagedSession {
    type Target = SessionHandle;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref().expect("session is held until drop")
    }
}

impl DerefMut for ManagedSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("session is held until drop")
    }
}

/// Snapshot of the pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub available: usize,
    pub in_use: usize,
    pub creating: usize,
    pub opened: usize,
    pub orphans: usize,
    pub waiters: usize,
    pub max_opened: usize,
}

/// Outcome of one keepalive sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub released: usize,
    pub pinged: usize,
    pub failed: usize,
}

/// Sessions have all sessions and waiters.
/// This is for atomically locking the waiting list and free sessions.
struct Sessions {
    available_sessions: VecDeque<SessionHandle>,

    /// names of the sessions handed out, including the ones being health checked.
    in_use: HashSet<String>,

    waiters: VecDeque<oneshot::Sender<()>>,

    /// Invalid sessions living in the server.
    orphans: Vec<SessionHandle>,

    /// number of sessions scheduled to be replenished.
    num_creating: usize,

    /// number of in-use sessions held by the keepalive sweep.
    num_checking: usize,

    closed: bool,
}

impl Sessions {
    fn new(available_sessions: VecDeque<SessionHandle>) -> Self {
        Sessions {
            available_sessions,
            in_use: HashSet::new(),
            waiters: VecDeque::new(),
            orphans: Vec::new(),
            num_creating: 0,
            num_checking: 0,
            closed: false,
        }
    }

    fn num_inuse(&self) -> usize {
        self.in_use.len()
    }

    fn num_opened(&self) -> usize {
        self.num_inuse() + self.available_sessions.len()
    }

    fn take_waiter(&mut self) -> Option<oneshot::Sender<()>> {
        while let Some(waiter) = self.waiters.pop_front() {
            // Waiter can be closed when session acquisition times out.
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    fn purge_closed_waiters(&mut self) {
        self.waiters.retain(|waiter| !waiter.is_closed());
    }

    /// Takes the most recently returned session.
    fn take(&mut self) -> Option<SessionHandle> {
        let session = self.available_sessions.pop_back()?;
        self.in_use.insert(session.session.name.clone());
        Some(session)
    }

    /// Gives the session back when it was not handed out by this pool.
    fn release(&mut self, session: SessionHandle) -> Result<(), SessionHandle> {
        if !self.in_use.remove(&session.session.name) {
            return Err(session);
        }
        if session.valid {
            self.available_sessions.push_back(session);
        } else if !session.deleted {
            tracing::trace!("save as orphan name={}", session.session.name);
            self.orphans.push(session);
        }
        Ok(())
    }

    /// reserve calculates next session count to create.
    /// Must call replenish after calling this method.
    fn reserve(&mut self, max_opened: usize, inc_step: usize) -> usize {
        let num_opened = self.num_opened();
        let num_creating = self.num_creating;
        if max_opened <= num_creating + num_opened {
            tracing::trace!(
                "No available connections max={}, num_creating={}, current={}",
                max_opened,
                num_creating,
                num_opened
            );
            return 0;
        }
        let increasing = (max_opened - (num_creating + num_opened)).min(inc_step);
        self.num_creating += increasing;
        increasing
    }

    /// Reserves the sessions needed to get back to `min_opened`.
    fn reserve_to_min(&mut self, min_opened: usize, max_opened: usize) -> usize {
        let target = min_opened.min(max_opened);
        let current = self.num_opened() + self.num_creating;
        if current >= target {
            return 0;
        }
        let increasing = target - current;
        self.num_creating += increasing;
        increasing
    }

    fn replenish(&mut self, session_count: usize, result: Result<Vec<SessionHandle>, Status>) {
        self.num_creating -= session_count;
        match result {
            Ok(mut new_sessions) => {
                while let Some(session) = new_sessions.pop() {
                    self.available_sessions.push_back(session);
                    if let Some(waiter) = self.take_waiter() {
                        let _ = waiter.send(());
                    }
                }
            }
            Err(e) => tracing::error!("failed to create new sessions {:?}", e),
        }
    }

    /// The pool can spare one idle session only while it holds more than min_opened
    /// sessions and more than min_opened are available.
    fn can_release(&self, min_opened: usize) -> bool {
        self.num_opened() > min_opened && self.available_sessions.len() > min_opened
    }

    /// Takes the available session idle the longest, when it has been idle for at
    /// least `trust_duration` and was not checked at `now` already.
    /// The session counts as in use until it is given back with `checkin_checked`.
    fn take_idle(&mut self, now: Instant, trust_duration: Duration) -> Option<SessionHandle> {
        if self.closed {
            return None;
        }
        let (index, _) = self
            .available_sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.last_checked_at < now && s.idle_since() + trust_duration <= now)
            .min_by_key(|(_, s)| s.idle_since())?;
        let session = self.available_sessions.remove(index)?;
        self.in_use.insert(session.session.name.clone());
        self.num_checking += 1;
        Some(session)
    }

    fn status(&self, max_opened: usize) -> PoolStatus {
        PoolStatus {
            available: self.available_sessions.len(),
            in_use: self.num_inuse(),
            creating: self.num_creating,
            opened: self.num_opened(),
            orphans: self.orphans.len(),
            waiters: self.waiters.iter().filter(|w| !w.is_closed()).count(),
            max_opened,
        }
    }
}

#[derive(Clone)]
struct SessionPool {
    id: u64,
    inner: Arc<RwLock<Sessions>>,
    session_creation_sender: UnboundedSender<usize>,
    config: Arc<SessionConfig>,
}

impl SessionPool {
    async fn new(
        database: String,
        conn_pool: &ConnectionManager,
        session_creation_sender: UnboundedSender<usize>,
        config: Arc<SessionConfig>,
    ) -> Result<Self, Status> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::SeqCst);
        let available_sessions = Self::init_pool(id, database, conn_pool, &config).await?;
        Ok(SessionPool {
            id,
            inner: Arc::new(RwLock::new(Sessions::new(available_sessions))),
            session_creation_sender,
            config,
        })
    }

    async fn init_pool(
        pool_id: u64,
        database: String,
        conn_pool: &ConnectionManager,
        config: &SessionConfig,
    ) -> Result<VecDeque<SessionHandle>, Status> {
        let channel_num = conn_pool.num();
        let creation_count_per_channel = config.min_opened / channel_num;
        let remainder = config.min_opened % channel_num;

        let mut sessions = Vec::<SessionHandle>::new();
        let mut tasks = JoinSet::new();
        for i in 0..channel_num {
            // Ensure that we create the exact number of requested sessions by adding the remainder to the first channel.
            let creation_count = if i == 0 {
                creation_count_per_channel + remainder
            } else {
                creation_count_per_channel
            };
            if creation_count == 0 {
                continue;
            }
            let next_client = conn_pool.conn().with_metadata(client_metadata(&database));
            let database = database.clone();
            let template = config.session_template();
            tasks.spawn(async move {
                batch_create_sessions(next_client, &database, creation_count, template, pool_id).await
            });
        }
        while let Some(r) = tasks.join_next().await {
            let new_sessions = r.map_err(|e| Status::internal(format!("session creation task failed: {e}")))??;
            sessions.extend(new_sessions);
        }
        tracing::debug!("initial session created count = {}", sessions.len());
        Ok(sessions.into())
    }

    fn num_opened(&self) -> usize {
        self.inner.read().num_opened()
    }

    fn status(&self) -> PoolStatus {
        self.inner.read().status(self.config.max_opened)
    }

    /// The client first checks the waiting list.
    /// If the waiting list is empty, it retrieves the most recently used available session.
    /// If there are no available sessions, it enters the waiting list, or fails at once
    /// when the pool is exhausted and fail_on_session_limit is set.
    /// The client on the waiting list will be notified when another client's session has finished and
    /// when the process of replenishing the available sessions is complete.
    async fn acquire(&self) -> Result<ManagedSession, SessionError> {
        let deadline = tokio::time::Instant::now() + self.config.session_get_timeout;
        loop {
            let (on_session_acquired, session_count) = {
                let mut sessions = self.inner.write();
                if sessions.closed {
                    return Err(SessionError::PoolClosed);
                }
                sessions.purge_closed_waiters();

                // Prioritize waiters over new acquirers.
                if sessions.waiters.is_empty() {
                    if let Some(mut s) = sessions.take() {
                        s.last_used_at = Instant::now();
                        return Ok(ManagedSession::new(self.clone(), s));
                    }
                }

                if self.config.fail_on_session_limit
                    && sessions.num_opened() + sessions.num_creating >= self.config.max_opened
                    && sessions.available_sessions.len() + sessions.num_creating + sessions.num_checking
                        <= sessions.waiters.len()
                {
                    tracing::debug!(
                        num_inuse = sessions.num_inuse(),
                        max_opened = self.config.max_opened,
                        "session limit reached"
                    );
                    return Err(SessionError::SessionLimit(self.config.max_opened));
                }

                // Add the participant to the waiting list.
                let (sender, receiver) = oneshot::channel();
                sessions.waiters.push_back(sender);
                let session_count = sessions.reserve(self.config.max_opened, self.config.inc_step);
                (receiver, session_count)
            };

            if session_count > 0 {
                let _ = self.session_creation_sender.send(session_count);
            }

            // Wait for the session available notification.
            match timeout_at(deadline, on_session_acquired).await {
                Ok(Ok(())) => {
                    let mut sessions = self.inner.write();
                    if let Some(mut s) = sessions.take() {
                        s.last_used_at = Instant::now();
                        return Ok(ManagedSession::new(self.clone(), s));
                    } else {
                        continue; // another waiter raced for session
                    }
                }
                // the pool dropped the waiting list
                Ok(Err(_)) => continue,
                Err(_) => {
                    {
                        let sessions = self.inner.read();
                        tracing::info!(
                            available = sessions.available_sessions.len(),
                            waiters = sessions.waiters.len(),
                            orphans = sessions.orphans.len(),
                            num_inuse = sessions.num_inuse(),
                            num_creating = sessions.num_creating,
                            max_opened = self.config.max_opened,
                            "Timeout acquiring session"
                        );
                    }
                    return Err(SessionError::SessionGetTimeout);
                }
            }
        }
    }

    fn recycle(&self, session: SessionHandle) {
        if let Err(e) = self.checkin(session) {
            tracing::error!("failed to recycle session: {}", e);
        }
    }

    /// If the session is valid
    ///  - Pass the session to the first user on the waiting list.
    ///  - If there is no waiting list, the session is returned to the list of available sessions.
    ///
    /// If the session is invalid
    ///  - Discard the session. If the number of sessions falls below the threshold as a result
    ///    of discarding, the session replenishment process is called.
    ///
    /// Sessions not handed out by this pool are rejected and the pool is left untouched.
    fn checkin(&self, session: SessionHandle) -> Result<(), SessionError> {
        self.checkin_internal(session, false)
    }

    /// Gives back a session taken by the keepalive sweep.
    fn checkin_checked(&self, session: SessionHandle) {
        if let Err(e) = self.checkin_internal(session, true) {
            tracing::error!("failed to recycle checked session: {}", e);
        }
    }

    fn checkin_internal(&self, mut session: SessionHandle, checked: bool) -> Result<(), SessionError> {
        if session.pool_id != self.id {
            return Err(SessionError::InvalidCheckin(session.session.name.clone()));
        }
        let now = Instant::now();
        let (waiter, session_count, deleting) = {
            let mut sessions = self.inner.write();
            if checked {
                sessions.num_checking = sessions.num_checking.saturating_sub(1);
            }
            if !sessions.in_use.contains(&session.session.name) {
                return Err(SessionError::InvalidCheckin(session.session.name.clone()));
            }
            if sessions.closed {
                sessions.in_use.remove(&session.session.name);
                (None, 0, Some(session))
            } else if session.valid {
                let waiter = sessions.take_waiter();
                if sessions.num_opened() > self.config.max_idle
                    && session.created_at + self.config.idle_timeout < now
                    && waiter.is_none()
                {
                    // Not reuse expired idle session
                    session.valid = false
                }
                session.last_used_at = now;
                let _ = sessions.release(session);
                (waiter, 0, None)
            } else {
                let _ = sessions.release(session);
                let session_count = if sessions.waiters.is_empty() {
                    sessions.reserve_to_min(self.config.min_opened, self.config.max_opened)
                } else {
                    sessions.reserve(self.config.max_opened, self.config.inc_step)
                };
                (None, session_count, None)
            }
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
        if session_count > 0 {
            let _ = self.session_creation_sender.send(session_count);
        }
        if let Some(session) = deleting {
            delete_in_background(vec![session]);
        }
        Ok(())
    }

    /// Releases at most one idle session when the pool is above min_opened and pings
    /// the other idle ones. Sessions that fail the ping are deleted.
    /// Only one session is held at a time, the others stay available for checkout.
    async fn keepalive_or_release(&self, now: Instant) -> SweepSummary {
        let trust_duration = self.config.session_alive_trust_duration;
        let mut summary = SweepSummary::default();
        let release = {
            let mut sessions = self.inner.write();
            if sessions.can_release(self.config.min_opened) {
                sessions.take_idle(now, trust_duration)
            } else {
                None
            }
        };
        if let Some(mut session) = release {
            tracing::debug!("release idle session {}", session.session.name);
            session.delete().await;
            summary.released += 1;
            self.checkin_checked(session);
        }
        loop {
            let session = { self.inner.write().take_idle(now, trust_duration) };
            let mut session = match session {
                Some(session) => session,
                None => break,
            };
            match session.ping(now).await {
                Ok(()) => summary.pinged += 1,
                Err(e) => {
                    tracing::debug!("keepalive failed for {}: {:?}", session.session.name, e);
                    session.last_checked_at = now;
                    session.delete().await;
                    summary.failed += 1;
                }
            }
            self.checkin_checked(session);
        }
        tracing::trace!(
            released = summary.released,
            pinged = summary.pinged,
            failed = summary.failed,
            "keepalive sweep done"
        );
        summary
    }

    /// Marks the pool closed and takes every session it still holds.
    fn drain(&self) -> Vec<SessionHandle> {
        let (deleting, waiters) = {
            let mut sessions = self.inner.write();
            sessions.closed = true;
            let waiters = mem::take(&mut sessions.waiters);
            let mut deleting: Vec<SessionHandle> = mem::take(&mut sessions.available_sessions).into();
            deleting.append(&mut sessions.orphans);
            (deleting, waiters)
        };
        // waking the waiters makes them observe the closed pool
        drop(waiters);
        deleting
    }

    async fn close(&self) {
        let deleting_sessions = self.drain();
        tracing::debug!("delete {} sessions on close", deleting_sessions.len());
        for mut session in deleting_sessions {
            session.delete().await;
        }
    }

    async fn remove_orphans(&self) {
        let deleting_sessions = { mem::take(&mut self.inner.write().orphans) };
        tracing::trace!("remove {} orphan sessions", deleting_sessions.len());
        for mut session in deleting_sessions {
            session.delete().await;
        }
    }
}

fn delete_in_background(sessions: Vec<SessionHandle>) {
    if sessions.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                for mut session in sessions {
                    session.delete().await;
                }
            });
        }
        Err(_) => tracing::warn!("no runtime to delete {} sessions", sessions.len()),
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// max_opened is the maximum number of opened sessions allowed by the session
    /// pool. If the client tries to open a session and there are already
    /// max_opened sessions, it will block until one becomes available or
    /// session_get_timeout elapses, or fail at once when fail_on_session_limit is set.
    pub max_opened: usize,

    /// min_opened is the minimum number of opened sessions that the session pool
    /// tries to maintain. Session pool won't continue to expire sessions if
    /// number of opened connections drops below min_opened. However, if a session
    /// is found to be broken, it will still be evicted from the session pool,
    /// therefore it is possible that the number of opened sessions drops below
    /// min_opened.
    pub min_opened: usize,

    /// max_idle is the maximum number of idle sessions, pool is allowed to keep.
    pub max_idle: usize,

    /// idle_timeout is the wait time before discarding an idle session.
    /// Sessions older than this value since they were last used will be discarded.
    /// However, if the number of sessions is less than or equal to min_opened, it will not be discarded.
    pub idle_timeout: Duration,

    /// Sessions used or pinged within this window are not pinged by the keepalive task.
    pub session_alive_trust_duration: Duration,

    /// session_get_timeout is the maximum value of the waiting time that occurs when retrieving from the connection pool when there is no idle session.
    pub session_get_timeout: Duration,

    /// refresh_interval is the interval of cleanup and health check functions.
    pub refresh_interval: Duration,

    /// inc_step is the number of sessions to create in one batch when at least
    /// one more session is needed.
    pub inc_step: usize,

    /// Fail checkout with SessionError::SessionLimit instead of waiting when
    /// max_opened sessions are in use.
    pub fail_on_session_limit: bool,

    /// Database role the sessions are created with.
    pub database_role: Option<String>,

    pub labels: BTreeMap<String, String>,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_opened == 0 {
            return Err("max_opened must be greater than 0".to_string());
        }
        if self.min_opened > self.max_opened {
            return Err(format!(
                "min_opened({}) must be less than or equal to max_opened({})",
                self.min_opened, self.max_opened
            ));
        }
        if self.inc_step == 0 {
            return Err("inc_step must be greater than 0".to_string());
        }
        Ok(())
    }

    fn session_template(&self) -> Option<Session> {
        if self.database_role.is_none() && self.labels.is_empty() {
            return None;
        }
        Some(Session {
            labels: self.labels.clone(),
            creator_role: self.database_role.clone().unwrap_or_default(),
            ..Default::default()
        })
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_opened: 400,
            min_opened: 10,
            max_idle: 300,
            inc_step: 25,
            idle_timeout: Duration::from_secs(30 * 60),
            session_alive_trust_duration: Duration::from_secs(55 * 60),
            session_get_timeout: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(5 * 60),
            fail_on_session_limit: false,
            database_role: None,
            labels: BTreeMap::new(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("session get time out")]
    SessionGetTimeout,
    #[error("session limit reached: max_opened={0}")]
    SessionLimit(usize),
    #[error("session {0} was not checked out from this pool")]
    InvalidCheckin(String),
    #[error("session pool is closed")]
    PoolClosed,
    #[error(transparent)]
    GRPC(#[from] Status),
}

impl TryAs<Status> for SessionError {
    fn try_as(&self) -> Option<&Status> {
        match self {
            SessionError::GRPC(e) => Some(e),
            _ => None,
        }
    }
}

pub struct SessionManager {
    session_pool: SessionPool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    pub async fn new(
        database: impl Into<String>,
        conn_pool: ConnectionManager,
        config: SessionConfig,
    ) -> Result<Arc<SessionManager>, Status> {
        let database = database.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let session_pool = SessionPool::new(database.clone(), &conn_pool, sender, Arc::new(config.clone())).await?;

        let cancel = CancellationToken::new();
        let task_session_cleaner = Self::spawn_health_check_task(config.clone(), session_pool.clone(), cancel.clone());
        let task_session_creator = Self::spawn_session_creation_task(
            session_pool.clone(),
            database,
            config.session_template(),
            conn_pool,
            receiver,
            cancel.clone(),
        );

        let sm = SessionManager {
            session_pool,
            cancel,
            tasks: Mutex::new(vec![task_session_cleaner, task_session_creator]),
        };
        Ok(Arc::new(sm))
    }

    pub fn pool_id(&self) -> u64 {
        self.session_pool.id
    }

    pub fn num_opened(&self) -> usize {
        self.session_pool.num_opened()
    }

    pub fn status(&self) -> PoolStatus {
        self.session_pool.status()
    }

    /// Checks a session out of the pool.
    pub async fn get(&self) -> Result<ManagedSession, SessionError> {
        self.session_pool.acquire().await
    }

    /// Checks a session back in. Dropping the session does the same; this variant
    /// reports sessions that belong to another pool.
    pub fn checkin(&self, session: ManagedSession) -> Result<(), SessionError> {
        if session.pool_id() != self.session_pool.id {
            // goes back to its own pool on drop
            return Err(SessionError::InvalidCheckin(session.name().to_string()));
        }
        match session.into_handle() {
            Some(handle) => self.session_pool.checkin(handle),
            None => Ok(()),
        }
    }

    /// Runs one keepalive sweep now instead of waiting for refresh_interval.
    pub async fn keepalive_or_release(&self) -> SweepSummary {
        self.session_pool.keepalive_or_release(Instant::now()).await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let tasks = { mem::take(&mut *self.tasks.lock()) };
        for task in tasks {
            let _ = task.await;
        }
        self.session_pool.close().await;
    }

    fn spawn_session_creation_task(
        session_pool: SessionPool,
        database: String,
        template: Option<Session>,
        conn_pool: ConnectionManager,
        mut rx: UnboundedReceiver<usize>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tasks = JoinSet::default();
            loop {
                select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(Ok((session_count, result))) = tasks.join_next(), if !tasks.is_empty() => {
                        session_pool.inner.write().replenish(session_count, result);
                    }
                    session_count = rx.recv() => match session_count {
                        Some(session_count) => {
                            let client = conn_pool.conn().with_metadata(client_metadata(&database));
                            let database = database.clone();
                            let template = template.clone();
                            let pool_id = session_pool.id;
                            tasks.spawn(async move {
                                (session_count, batch_create_sessions(client, &database, session_count, template, pool_id).await)
                            });
                        },
                        None => continue
                    },
                }
            }
            tracing::trace!("shutdown session creation task.");
        })
    }

    fn spawn_health_check_task(
        config: SessionConfig,
        session_pool: SessionPool,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let start = Instant::now() + config.refresh_interval;
        let mut interval = tokio::time::interval_at(start.into(), config.refresh_interval);

        tokio::spawn(async move {
            loop {
                select! {
                    _ = interval.tick() => {},
                    _ = cancel.cancelled() => break
                }

                // remove orphans first
                session_pool.remove_orphans().await;

                session_pool.keepalive_or_release(Instant::now()).await;
            }
            tracing::trace!("shutdown health check task.")
        })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        delete_in_background(self.session_pool.drain());
    }
}

async fn batch_create_sessions(
    spanner_client: Client,
    database: &str,
    mut remaining_create_count: usize,
    template: Option<Session>,
    pool_id: u64,
) -> Result<Vec<SessionHandle>, Status> {
    let mut created = Vec::with_capacity(remaining_create_count);
    while remaining_create_count > 0 {
        let requested = remaining_create_count.min(MAX_BATCH_CREATE_COUNT);
        let result = batch_create_session(&spanner_client, database, requested, template.clone(), pool_id).await;
        // Spanner could return less sessions than requested.
        // In that case, we should do another call using the same gRPC channel.
        let sessions = match result {
            Ok(sessions) if sessions.is_empty() => Err(Status::resource_exhausted("no session was created")),
            other => other,
        };
        match sessions {
            Ok(sessions) => {
                remaining_create_count = remaining_create_count.saturating_sub(sessions.len());
                created.extend(sessions);
            }
            Err(e) if created.is_empty() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "created {} sessions, {} are missing: {:?}",
                    created.len(),
                    remaining_create_count,
                    e
                );
                break;
            }
        }
    }
    Ok(created)
}

async fn batch_create_session(
    spanner_client: &Client,
    database: &str,
    session_count: usize,
    template: Option<Session>,
    pool_id: u64,
) -> Result<Vec<SessionHandle>, Status> {
    let request = BatchCreateSessionsRequest {
        database: database.to_string(),
        session_template: template,
        session_count: session_count as i32,
    };

    tracing::debug!("spawn session creation request : session_count = {}", session_count);
    let response = spanner_client.batch_create_sessions(request, None).await?;

    let now = Instant::now();
    Ok(response
        .session
        .into_iter()
        .map(|s| SessionHandle::new(s, spanner_client.clone(), pool_id, now))
        .collect::<Vec<SessionHandle>>())
}

pub(crate) fn client_metadata(database: &str) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    match MetadataValue::<Ascii>::try_from(database) {
        Ok(value) => {
            metadata.insert("google-cloud-resource-prefix", value);
        }
        Err(e) => tracing::warn!("invalid database name {}: {:?}", database, e),
    }
    metadata
}
