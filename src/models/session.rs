use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    Running,
    Ended,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "Idle",
            SessionStatus::Running => "Running",
            SessionStatus::Ended => "Ended",
            SessionStatus::Terminated => "Terminated",
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Idle
    }
}

type TerminateFn = Box<dyn Fn() + Send + Sync>;

struct TerminatorInner {
    on_terminate: TerminateFn,
    fired: AtomicBool,
}

/// The single channel through which a backend verdict ends a session.
///
/// Every monitor of one attempt shares the same `Terminator`; the host
/// callback runs at most once no matter how many responses carry the verdict.
#[derive(Clone)]
pub struct Terminator {
    inner: Arc<TerminatorInner>,
}

impl Terminator {
    pub fn new(on_terminate: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(TerminatorInner {
                on_terminate: Box::new(on_terminate),
                fired: AtomicBool::new(false),
            }),
        }
    }

    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Returns true when this call is the one that invoked the host callback.
    pub fn terminate(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        log::warn!("backend issued termination verdict; ending session");
        (self.inner.on_terminate)();
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminator")
            .field("fired", &self.is_terminated())
            .finish()
    }
}

/// Identifies the attempt being proctored. Cheap to clone; every monitor of
/// the attempt holds one.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_id: Arc<str>,
    active: Arc<AtomicBool>,
    terminator: Terminator,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, terminator: Terminator) -> Self {
        let session_id: String = session_id.into();
        Self {
            session_id: Arc::from(session_id),
            active: Arc::new(AtomicBool::new(true)),
            terminator,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Host-controlled switch; monitors drop observations while it is off.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.terminator.is_terminated()
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }
}
