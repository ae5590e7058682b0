//! JIT Activation State Machine
//!
//! Some hosts only permit JIT after an out-of-band step, for example a
//! debugger attaching to the process and granting the capability. This module
//! tracks whether JIT is currently permitted and mediates that deferred
//! handshake:
//!
//! ```text
//!            request_activation()              host grant (check_status)
//!  Disabled ───────────────────────> Pending ───────────────────────────> Enabled
//!            check_status() sees an            notify_activated()
//!            outstanding host request
//!
//!  any state ──(unexpected host response / fail())──> Error
//!  Error ──request_activation()──> Pending
//! ```
//!
//! A host that already grants JIT does not enable anything on its own: the
//! machine stays `Disabled` until a request has gone out.
//!
//! `Enabled` and `Error` are terminal for [`ActivationStateMachine::wait_for_activation`].
//! Waiting uses a condition variable signalled on every transition; a bounded
//! wait leaves the state untouched when it times out.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{JitMemoryError, JitMemoryResult};

/// Whether JIT is currently permitted by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActivationState {
    /// No enable request issued yet (initial state)
    Disabled = 0,

    /// Enable requested, waiting for the host to grant it
    Pending = 1,

    /// Host granted JIT; native code may run
    Enabled = 2,

    /// Host answered unexpectedly; JIT unusable for this run
    Error = 3,
}

impl ActivationState {
    /// `Enabled` or `Error`
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActivationState::Enabled | ActivationState::Error)
    }
}

impl From<u8> for ActivationState {
    fn from(v: u8) -> Self {
        match v {
            0 => ActivationState::Disabled,
            1 => ActivationState::Pending,
            2 => ActivationState::Enabled,
            _ => ActivationState::Error,
        }
    }
}

// =============================================================================
// Host interface
// =============================================================================

/// Answer of a host JIT permission query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostJitStatus {
    /// JIT execution is permitted
    Granted,

    /// JIT execution is not (yet) permitted
    NotGranted,

    /// The query itself failed or returned something unexpected
    Unavailable(String),
}

/// Host-specific JIT permission mechanism.
pub trait JitHost: Send + Sync {
    /// Report whether JIT is currently permitted for this process.
    fn query(&self) -> HostJitStatus;

    /// Issue a request to enable JIT. Returns whether the request was issued.
    fn request_enable(&self) -> bool;

    /// Whether an enable request has been issued to the host, by this
    /// process or out of band, and not withdrawn.
    fn request_outstanding(&self) -> bool {
        false
    }
}

/// How a [`ProcessHost`] decides that JIT is granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantPolicy {
    /// JIT is always permitted; W^X is enforced by the dual mapping alone
    Always,

    /// JIT is permitted once a debugger is attached to the process
    DebuggerAttached,
}

/// Queries the real process environment.
#[derive(Debug)]
pub struct ProcessHost {
    policy: GrantPolicy,
    requested: AtomicBool,
}

impl ProcessHost {
    /// Host with the platform's default policy: debugger-gated on Apple
    /// mobile targets, always granted elsewhere.
    pub fn new() -> Self {
        let policy = if cfg!(any(
            target_os = "ios",
            target_os = "tvos",
            target_os = "visionos",
            target_os = "watchos"
        )) {
            GrantPolicy::DebuggerAttached
        } else {
            GrantPolicy::Always
        };
        Self::with_policy(policy)
    }

    pub fn with_policy(policy: GrantPolicy) -> Self {
        ProcessHost {
            policy,
            requested: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> GrantPolicy {
        self.policy
    }
}

impl Default for ProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl JitHost for ProcessHost {
    fn query(&self) -> HostJitStatus {
        match self.policy {
            GrantPolicy::Always => HostJitStatus::Granted,
            GrantPolicy::DebuggerAttached => match debugger_attached() {
                Ok(true) => HostJitStatus::Granted,
                Ok(false) => HostJitStatus::NotGranted,
                Err(reason) => HostJitStatus::Unavailable(reason),
            },
        }
    }

    fn request_enable(&self) -> bool {
        if self.policy == GrantPolicy::DebuggerAttached {
            debug!(
                pid = std::process::id(),
                "JIT requested; waiting for an external debugger to attach"
            );
        }
        self.requested.store(true, Ordering::Release);
        true
    }

    fn request_outstanding(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

#[cfg(target_vendor = "apple")]
unsafe extern "C" {
    fn csops(
        pid: libc::pid_t,
        ops: libc::c_uint,
        useraddr: *mut libc::c_void,
        usersize: libc::size_t,
    ) -> libc::c_int;
}

/// Code-signing status flag: process is being debugged
#[cfg(target_vendor = "apple")]
const CS_DEBUGGED: u32 = 0x1000_0000;

#[cfg(target_vendor = "apple")]
fn debugger_attached() -> Result<bool, String> {
    const CS_OPS_STATUS: libc::c_uint = 0;
    let mut flags: u32 = 0;
    let rc = unsafe {
        csops(
            libc::getpid(),
            CS_OPS_STATUS,
            &mut flags as *mut u32 as *mut libc::c_void,
            std::mem::size_of::<u32>(),
        )
    };
    if rc != 0 {
        return Err(format!("csops failed: {}", std::io::Error::last_os_error()));
    }
    Ok(flags & CS_DEBUGGED != 0)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn debugger_attached() -> Result<bool, String> {
    let status = std::fs::read_to_string("/proc/self/status")
        .map_err(|e| format!("reading /proc/self/status: {}", e))?;
    parse_tracer_pid(&status)
        .map(|pid| pid != 0)
        .ok_or_else(|| "TracerPid missing from /proc/self/status".to_string())
}

#[cfg(not(any(target_vendor = "apple", target_os = "linux", target_os = "android")))]
fn debugger_attached() -> Result<bool, String> {
    Err("debugger detection unsupported on this platform".to_string())
}

/// Extract `TracerPid` from the contents of `/proc/<pid>/status`.
#[cfg_attr(not(any(test, target_os = "linux", target_os = "android")), allow(dead_code))]
fn parse_tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|rest| rest.trim().parse().ok())
}

/// Host whose answer is set programmatically.
///
/// Used by tests and by embedders that run the handshake themselves.
#[derive(Debug)]
pub struct ManualHost {
    status: Mutex<HostJitStatus>,
    accept_requests: AtomicBool,
    requests: AtomicU32,
}

impl ManualHost {
    pub fn new() -> Self {
        ManualHost {
            status: Mutex::new(HostJitStatus::NotGranted),
            accept_requests: AtomicBool::new(true),
            requests: AtomicU32::new(0),
        }
    }

    pub fn grant(&self) {
        *self.status.lock() = HostJitStatus::Granted;
    }

    pub fn revoke(&self) {
        *self.status.lock() = HostJitStatus::NotGranted;
    }

    pub fn set_status(&self, status: HostJitStatus) {
        *self.status.lock() = status;
    }

    /// Make `request_enable` report that no request could be issued.
    pub fn refuse_requests(&self) {
        self.accept_requests.store(false, Ordering::Release);
    }

    /// Number of enable requests received
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::Acquire)
    }
}

impl Default for ManualHost {
    fn default() -> Self {
        Self::new()
    }
}

impl JitHost for ManualHost {
    fn query(&self) -> HostJitStatus {
        self.status.lock().clone()
    }

    fn request_enable(&self) -> bool {
        self.requests.fetch_add(1, Ordering::AcqRel);
        self.accept_requests.load(Ordering::Acquire)
    }

    fn request_outstanding(&self) -> bool {
        self.requests() > 0 && self.accept_requests.load(Ordering::Acquire)
    }
}

// =============================================================================
// State machine
// =============================================================================

/// Tracks JIT permission and runs the deferred-activation handshake.
///
/// # Thread Safety
///
/// Transitions happen under a mutex and are broadcast on a condition variable.
/// The current state is mirrored in an atomic so [`is_jit_enabled`] never
/// takes the lock.
///
/// [`is_jit_enabled`]: ActivationStateMachine::is_jit_enabled
pub struct ActivationStateMachine {
    host: Arc<dyn JitHost>,
    state: Mutex<ActivationState>,
    /// Lock-free copy of `state`
    current: AtomicU8,
    changed: Condvar,
}

impl ActivationStateMachine {
    pub fn new(host: Arc<dyn JitHost>) -> Self {
        ActivationStateMachine {
            host,
            state: Mutex::new(ActivationState::Disabled),
            current: AtomicU8::new(ActivationState::Disabled as u8),
            changed: Condvar::new(),
        }
    }

    /// State machine backed by [`ProcessHost::new`]
    pub fn with_process_host() -> Self {
        Self::new(Arc::new(ProcessHost::new()))
    }

    /// Current state (lock-free)
    #[inline]
    pub fn state(&self) -> ActivationState {
        ActivationState::from(self.current.load(Ordering::Acquire))
    }

    /// Whether native code may run right now. No side effects.
    #[inline]
    pub fn is_jit_enabled(&self) -> bool {
        self.state() == ActivationState::Enabled
    }

    /// Update the state under the lock and wake every waiter.
    fn transition(&self, state: &mut ActivationState, to: ActivationState) {
        if *state == to {
            return;
        }
        debug!(from = ?*state, to = ?to, "JIT activation transition");
        *state = to;
        self.current.store(to as u8, Ordering::Release);
        self.changed.notify_all();
    }

    /// Ask the host to enable JIT (the "debug mode" request).
    ///
    /// `Disabled` and `Error` move to `Pending`; `Pending` stays `Pending`.
    /// Nothing is requested once `Enabled`. Returns whether JIT is enabled or
    /// a request is outstanding.
    pub fn request_activation(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ActivationState::Enabled {
            return true;
        }
        if self.host.request_enable() {
            self.transition(&mut state, ActivationState::Pending);
            true
        } else {
            warn!("host refused to issue a JIT enable request");
            self.transition(&mut state, ActivationState::Error);
            false
        }
    }

    /// Query the host and move the state accordingly.
    ///
    /// - `Disabled` -> `Pending` once the host reports an outstanding request
    /// - `Granted` while `Pending` -> `Enabled`
    /// - `Granted` while `Disabled` with no request -> unchanged
    /// - `Unavailable` while not terminal -> `Error`
    ///
    /// `Enabled` and `Error` are not left here.
    pub fn check_status(&self) -> ActivationState {
        let status = self.host.query();
        let outstanding = self.host.request_outstanding();
        let mut state = self.state.lock();
        trace!(status = ?status, outstanding, state = ?*state, "JIT host status");

        if *state == ActivationState::Disabled && outstanding {
            self.transition(&mut state, ActivationState::Pending);
        }

        match (*state, status) {
            (ActivationState::Enabled | ActivationState::Error, _) => {}
            (_, HostJitStatus::Unavailable(reason)) => {
                warn!(%reason, "JIT host query failed");
                self.transition(&mut state, ActivationState::Error);
            }
            (ActivationState::Pending, HostJitStatus::Granted) => {
                self.transition(&mut state, ActivationState::Enabled);
            }
            (_, HostJitStatus::Granted | HostJitStatus::NotGranted) => {}
        }
        *state
    }

    /// Externally triggered grant. Safe with or without waiters.
    pub fn notify_activated(&self) {
        let mut state = self.state.lock();
        self.transition(&mut state, ActivationState::Enabled);
    }

    /// Force the `Error` state, waking every waiter.
    pub fn fail(&self, reason: &str) {
        warn!(%reason, "JIT activation failed");
        let mut state = self.state.lock();
        self.transition(&mut state, ActivationState::Error);
    }

    /// Block until `Enabled` or `Error`, or until `timeout` elapses.
    ///
    /// `None` waits without bound. On timeout the state is left as it was
    /// (typically `Pending`) and `ActivationTimeout` is returned so the caller
    /// can keep interpreting and retry later.
    pub fn wait_for_activation(&self, timeout: Option<Duration>) -> JitMemoryResult<ActivationState> {
        let start = Instant::now();
        let deadline = timeout.and_then(|t| start.checked_add(t));
        let mut state = self.state.lock();

        while !state.is_terminal() {
            match (timeout, deadline) {
                (None, _) => self.changed.wait(&mut state),
                (Some(waited), Some(deadline)) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out()
                        && !state.is_terminal()
                    {
                        debug!(?waited, state = ?*state, "JIT activation wait timed out");
                        return Err(JitMemoryError::ActivationTimeout { waited });
                    }
                }
                // Timeout too large to represent as an instant
                (Some(_), None) => self.changed.wait(&mut state),
            }
        }
        Ok(*state)
    }
}

impl std::fmt::Debug for ActivationStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationStateMachine")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn new_machine() -> (Arc<ManualHost>, ActivationStateMachine) {
        let host = Arc::new(ManualHost::new());
        let machine = ActivationStateMachine::new(host.clone());
        (host, machine)
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(ActivationState::from(0), ActivationState::Disabled);
        assert_eq!(ActivationState::from(1), ActivationState::Pending);
        assert_eq!(ActivationState::from(2), ActivationState::Enabled);
        assert_eq!(ActivationState::from(3), ActivationState::Error);
        assert_eq!(ActivationState::from(200), ActivationState::Error);
    }

    #[test]
    fn test_check_before_request_stays_disabled() {
        let (_host, machine) = new_machine();
        assert_eq!(machine.state(), ActivationState::Disabled);
        assert_eq!(machine.check_status(), ActivationState::Disabled);
        assert!(!machine.is_jit_enabled());
    }

    #[test]
    fn test_request_then_grant() {
        let (host, machine) = new_machine();
        assert!(machine.request_activation());
        assert_eq!(host.requests(), 1);
        assert_eq!(machine.state(), ActivationState::Pending);

        assert_eq!(machine.check_status(), ActivationState::Pending);
        host.grant();
        assert_eq!(machine.check_status(), ActivationState::Enabled);
        assert!(machine.is_jit_enabled());

        // Already enabled: no further requests reach the host
        assert!(machine.request_activation());
        assert_eq!(host.requests(), 1);
    }

    #[test]
    fn test_grant_without_request_stays_disabled() {
        let (host, machine) = new_machine();
        host.grant();
        assert_eq!(machine.check_status(), ActivationState::Disabled);
        assert!(!machine.is_jit_enabled());

        // The grant is picked up once a request goes out
        assert!(machine.request_activation());
        assert_eq!(machine.state(), ActivationState::Pending);
        assert_eq!(machine.check_status(), ActivationState::Enabled);
    }

    #[test]
    fn test_always_granting_host_needs_a_request() {
        let machine =
            ActivationStateMachine::new(Arc::new(ProcessHost::with_policy(GrantPolicy::Always)));
        assert_eq!(machine.check_status(), ActivationState::Disabled);
        assert_eq!(machine.check_status(), ActivationState::Disabled);

        machine.request_activation();
        assert_eq!(machine.check_status(), ActivationState::Enabled);
    }

    #[test]
    fn test_out_of_band_request_moves_to_pending() {
        let (host, machine) = new_machine();
        // Request issued to the host directly, not through the machine
        assert!(host.request_enable());
        assert_eq!(machine.check_status(), ActivationState::Pending);

        host.grant();
        assert_eq!(machine.check_status(), ActivationState::Enabled);
    }

    #[test]
    fn test_refused_out_of_band_request_is_not_outstanding() {
        let (host, machine) = new_machine();
        host.refuse_requests();
        assert!(!host.request_enable());
        assert_eq!(machine.check_status(), ActivationState::Disabled);
    }

    #[test]
    fn test_unexpected_host_answer_is_error() {
        let (host, machine) = new_machine();
        machine.request_activation();
        host.set_status(HostJitStatus::Unavailable("bogus".into()));
        assert_eq!(machine.check_status(), ActivationState::Error);

        // Error is sticky for check_status, but a new request re-enters Pending
        host.grant();
        assert_eq!(machine.check_status(), ActivationState::Error);
        assert!(machine.request_activation());
        assert_eq!(machine.state(), ActivationState::Pending);
        assert_eq!(machine.check_status(), ActivationState::Enabled);
    }

    #[test]
    fn test_refused_request_is_error() {
        let (host, machine) = new_machine();
        host.refuse_requests();
        assert!(!machine.request_activation());
        assert_eq!(machine.state(), ActivationState::Error);
    }

    #[test]
    fn test_enabled_survives_host_failure() {
        let (host, machine) = new_machine();
        machine.notify_activated();
        host.set_status(HostJitStatus::Unavailable("gone".into()));
        assert_eq!(machine.check_status(), ActivationState::Enabled);
    }

    #[test]
    fn test_zero_timeout_leaves_pending() {
        let (_host, machine) = new_machine();
        machine.request_activation();
        let result = machine.wait_for_activation(Some(Duration::ZERO));
        assert_eq!(
            result,
            Err(JitMemoryError::ActivationTimeout {
                waited: Duration::ZERO
            })
        );
        assert_eq!(machine.state(), ActivationState::Pending);
    }

    #[test]
    fn test_wait_returns_immediately_when_terminal() {
        let (_host, machine) = new_machine();
        machine.notify_activated();
        assert_eq!(
            machine.wait_for_activation(Some(Duration::ZERO)),
            Ok(ActivationState::Enabled)
        );

        let (_host, machine) = new_machine();
        machine.fail("test");
        assert_eq!(machine.wait_for_activation(None), Ok(ActivationState::Error));
    }

    #[test]
    fn test_notify_wakes_blocked_waiter() {
        let (_host, machine) = new_machine();
        let machine = Arc::new(machine);
        machine.request_activation();

        let waiter = {
            let machine = Arc::clone(&machine);
            thread::spawn(move || machine.wait_for_activation(Some(Duration::from_secs(30))))
        };

        thread::sleep(Duration::from_millis(20));
        machine.notify_activated();

        assert_eq!(waiter.join().unwrap(), Ok(ActivationState::Enabled));
        assert!(machine.is_jit_enabled());
    }

    #[test]
    fn test_notify_without_waiters() {
        let (_host, machine) = new_machine();
        machine.notify_activated();
        machine.notify_activated();
        assert_eq!(machine.state(), ActivationState::Enabled);
    }

    #[test]
    fn test_parse_tracer_pid() {
        let status = "Name:\ttest\nState:\tR (running)\nTracerPid:\t0\nUid:\t0\n";
        assert_eq!(parse_tracer_pid(status), Some(0));
        let status = "Name:\tx\nTracerPid:\t4242\n";
        assert_eq!(parse_tracer_pid(status), Some(4242));
        assert_eq!(parse_tracer_pid("Name:\tx\n"), None);
    }

    #[test]
    fn test_process_host_always_policy() {
        let host = ProcessHost::with_policy(GrantPolicy::Always);
        assert_eq!(host.query(), HostJitStatus::Granted);
        assert!(!host.request_outstanding());
        assert!(host.request_enable());
        assert!(host.request_outstanding());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_process_host_debugger_policy_answers() {
        let host = ProcessHost::with_policy(GrantPolicy::DebuggerAttached);
        assert!(matches!(
            host.query(),
            HostJitStatus::Granted | HostJitStatus::NotGranted
        ));
    }
}
