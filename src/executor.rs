//! One-shot command execution
//!
//! Each run gets a fresh jail: create, provision, execute, then force-stop
//! and destroy no matter how the earlier steps went. Teardown lives in the
//! `Drop` of [`ScopedJail`], so every return path runs it exactly once.
//!
//! Concurrent runs either queue on a gate (`serialized`) or each get their
//! own jail name and address (`unique`). Launches pass through a token
//! bucket first.

use crate::error::{Error, Result};
use crate::jail::{Sortie, SortieMachineEvent, Stage};
use crate::manifest::{LaunchPolicy, RateLimitConfig, RetryConfig, SkiffConfig};
use crate::network::{InterfaceBinding, IpPool};
use crate::provider::{JailHandle, JailProvider, JailSpec};
use chrono_machines::BackoffStrategy;
use rand::rng;
use serde::Serialize;
use std::any::Any;
use std::net::Ipv4Addr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use throttle_machines::token_bucket;
use tracing::{debug, error, info, instrument, warn};

/// Result of one run, always materialized in full
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "text", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The command ran; its combined output, whatever the exit status
    Success(String),
    /// The jail could not be created
    CreationFailed(String),
    /// The jail was created but could not be populated or started
    ProvisionFailed(String),
    /// The command could not be run to completion
    ExecutionFailed(String),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success(_))
    }

    /// Output on success, diagnostic otherwise
    pub fn text(&self) -> &str {
        match self {
            ExecutionOutcome::Success(text)
            | ExecutionOutcome::CreationFailed(text)
            | ExecutionOutcome::ProvisionFailed(text)
            | ExecutionOutcome::ExecutionFailed(text) => text,
        }
    }
}

/// The parts of every jail spec that don't vary between runs
#[derive(Debug, Clone)]
struct JailTemplate {
    name: String,
    network_enabled: bool,
    address: Ipv4Addr,
    prefix_len: u8,
    default_route: Ipv4Addr,
    binding: InterfaceBinding,
}

impl JailTemplate {
    fn spec(&self, name: String, address: Ipv4Addr, prefix_len: u8) -> JailSpec {
        JailSpec {
            name,
            network_enabled: self.network_enabled,
            ipv4_address: address,
            prefix_len,
            default_route: self.default_route,
            interface_binding: self.binding.clone(),
            hostname: None,
        }
    }
}

/// Token bucket shared by all launches
struct LaunchLimiter {
    state: Mutex<(f64, Instant)>,
    epoch: Instant,
    capacity: f64,
    refill_per_sec: f64,
}

impl LaunchLimiter {
    fn new(config: &RateLimitConfig) -> Self {
        let epoch = Instant::now();
        Self {
            state: Mutex::new((config.capacity, epoch)),
            epoch,
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
        }
    }

    /// Block until a launch token is available
    fn acquire(&self) {
        loop {
            let mut state = lock(&self.state);
            let (tokens, last_refill) = *state;
            let now = Instant::now();
            let now_secs = now.duration_since(self.epoch).as_secs_f64();
            let last_refill_secs = last_refill.duration_since(self.epoch).as_secs_f64();

            let result = token_bucket::check(
                tokens,
                last_refill_secs,
                now_secs,
                self.capacity,
                self.refill_per_sec,
            );

            if result.allowed {
                *state = (result.new_tokens, now);
                return;
            }

            let retry_after = result.retry_after;
            drop(state);
            debug!(retry_after, "launch rate limited");
            thread::sleep(Duration::from_secs_f64(retry_after));
        }
    }
}

/// Runs commands in throwaway jails
pub struct OneShotExecutor<P: JailProvider> {
    provider: P,
    template: JailTemplate,
    release: String,
    timeout: Option<Duration>,
    /// Held for a whole run under the serialized policy
    gate: Option<Mutex<()>>,
    /// Address pool under the unique policy
    pool: Option<Mutex<IpPool>>,
    counter: AtomicU64,
    limiter: LaunchLimiter,
    cleanup: RetryConfig,
}

impl<P: JailProvider> OneShotExecutor<P> {
    pub fn new(provider: P, config: &SkiffConfig) -> Result<Self> {
        let oneshot = &config.oneshot;
        let network = &oneshot.network;
        let address = network.address()?;

        let template = JailTemplate {
            name: oneshot.name.clone(),
            network_enabled: network.vnet,
            address: address.addr(),
            prefix_len: address.prefix_len(),
            default_route: network.gateway()?,
            binding: network.binding()?,
        };

        let (gate, pool) = match oneshot.policy {
            LaunchPolicy::Serialized => (Some(Mutex::new(())), None),
            LaunchPolicy::Unique => {
                let subnet = network.pool()?.ok_or_else(|| {
                    Error::ConfigValidation(
                        "The 'unique' policy requires [oneshot.network] pool".into(),
                    )
                })?;
                let pool = IpPool::with_gateway(subnet, template.default_route)?;
                (None, Some(Mutex::new(pool)))
            }
        };

        Ok(Self {
            provider,
            template,
            release: oneshot.release.clone(),
            timeout: oneshot.timeout(),
            gate,
            pool,
            counter: AtomicU64::new(0),
            limiter: LaunchLimiter::new(&config.rate_limit),
            cleanup: config.cleanup.clone(),
        })
    }

    #[cfg(test)]
    fn provider(&self) -> &P {
        &self.provider
    }

    /// Run `command` with the configured timeout
    pub fn run_once(&self, command: &str) -> ExecutionOutcome {
        self.run_once_with_timeout(command, self.timeout)
    }

    /// Run `command` in a fresh jail and tear the jail down afterwards
    #[instrument(skip(self, command), fields(release = %self.release))]
    pub fn run_once_with_timeout(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> ExecutionOutcome {
        if command.trim().is_empty() {
            return ExecutionOutcome::ExecutionFailed("empty command".into());
        }

        self.limiter.acquire();
        let _gate = self.gate.as_ref().map(lock);

        let (spec, _lease) = match self.next_spec() {
            Ok(next) => next,
            Err(e) => return ExecutionOutcome::CreationFailed(e.to_string()),
        };
        info!(jail = %spec.name, address = %spec.cidr(), "launching one-shot jail");

        let mut sortie = Sortie::new(&spec.name);
        let handle = match guarded(|| self.provider.create(&spec)) {
            Ok(handle) => handle,
            Err(message) => {
                sortie.advance(SortieMachineEvent::Fail);
                warn!(jail = %spec.name, error = %message, "create failed");
                return ExecutionOutcome::CreationFailed(message);
            }
        };
        sortie.advance(SortieMachineEvent::Create);

        let mut jail = ScopedJail {
            provider: &self.provider,
            handle: Some(handle),
            sortie,
            retry: &self.cleanup,
        };

        if let Err(message) = guarded(|| self.provider.provision(jail.handle_mut(), &self.release))
        {
            warn!(jail = %spec.name, error = %message, "provision failed");
            return ExecutionOutcome::ProvisionFailed(message);
        }
        jail.sortie.advance(SortieMachineEvent::Provision);

        let outcome = match guarded(|| self.provider.execute(jail.handle(), command, timeout)) {
            Ok(output) => ExecutionOutcome::Success(output),
            Err(message) => {
                warn!(jail = %spec.name, error = %message, "execution failed");
                ExecutionOutcome::ExecutionFailed(message)
            }
        };
        jail.sortie.advance(SortieMachineEvent::Execute);

        outcome
    }

    /// Pick the name and address for the next run
    fn next_spec(&self) -> Result<(JailSpec, Option<AddressLease<'_>>)> {
        let template = &self.template;

        match &self.pool {
            None => Ok((
                template.spec(template.name.clone(), template.address, template.prefix_len),
                None,
            )),
            Some(pool) => {
                let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                let (address, prefix_len) = {
                    let mut pool = lock(pool);
                    (pool.allocate()?, pool.prefix_len())
                };
                let name = format!("{}-{}", template.name, seq);
                let lease = AddressLease { pool, address };
                Ok((template.spec(name, address, prefix_len), Some(lease)))
            }
        }
    }
}

/// Returns an address to the pool once the run that used it is over
struct AddressLease<'a> {
    pool: &'a Mutex<IpPool>,
    address: Ipv4Addr,
}

impl Drop for AddressLease<'_> {
    fn drop(&mut self) {
        lock(self.pool).release(&self.address);
    }
}

/// Owns a created jail and tears it down when dropped
struct ScopedJail<'a, P: JailProvider> {
    provider: &'a P,
    handle: Option<JailHandle>,
    sortie: Sortie,
    retry: &'a RetryConfig,
}

impl<P: JailProvider> ScopedJail<'_, P> {
    fn handle(&self) -> &JailHandle {
        match &self.handle {
            Some(handle) => handle,
            None => unreachable!("handle is only taken on drop"),
        }
    }

    fn handle_mut(&mut self) -> &mut JailHandle {
        match &mut self.handle {
            Some(handle) => handle,
            None => unreachable!("handle is only taken on drop"),
        }
    }
}

impl<P: JailProvider> Drop for ScopedJail<'_, P> {
    fn drop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        let provider = self.provider;
        let name = handle.name.clone();

        if self.sortie.stage() != Stage::Provisioned && self.sortie.stage() != Stage::Executed {
            self.sortie.advance(SortieMachineEvent::Fail);
        }

        let stopped = with_retries(self.retry, "stop", &name, || {
            guarded(|| provider.stop(&mut handle, true))
        });
        if stopped {
            self.sortie.advance(SortieMachineEvent::Stop);
        }

        let destroyed = with_retries(self.retry, "destroy", &name, || {
            guarded(|| provider.destroy(&handle))
        });
        if destroyed {
            self.sortie.advance(SortieMachineEvent::Destroy);
        }

        debug!(jail = %name, stage = ?self.sortie.stage(), "cleanup finished");
    }
}

/// Retry a cleanup step with backoff, logging the final failure
fn with_retries(
    config: &RetryConfig,
    step: &str,
    jail: &str,
    mut op: impl FnMut() -> std::result::Result<(), String>,
) -> bool {
    let backoff = config.backoff();
    let mut rng = rng();
    let mut attempt: u8 = 0;

    loop {
        attempt += 1;
        match op() {
            Ok(()) => return true,
            Err(message) => {
                if let Some(delay_ms) = backoff.delay(attempt, &mut rng) {
                    warn!(jail, step, attempt, delay_ms, error = %message, "cleanup step failed, retrying");
                    thread::sleep(Duration::from_millis(delay_ms));
                } else {
                    error!(jail, step, attempt, error = %message, "cleanup step gave up");
                    return false;
                }
            }
        }
    }
}

/// Run a provider step, turning errors and panics into a message
fn guarded<T>(step: impl FnOnce() -> Result<T>) -> std::result::Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("provider panicked: {}", panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Script {
        create_err: Option<fn() -> Error>,
        provision_err: bool,
        provision_panics: bool,
        execute: Option<fn(&str, Option<Duration>) -> Result<String>>,
        stop_failures: usize,
        destroy_err: bool,
        execute_delay: Option<Duration>,
    }

    /// Provider that records every call instead of touching the host
    #[derive(Default)]
    struct Recorder {
        script: Script,
        calls: Mutex<Vec<String>>,
        stop_attempts: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
        specs: Mutex<Vec<JailSpec>>,
    }

    impl Recorder {
        fn with(script: Script) -> Self {
            Self {
                script,
                ..Default::default()
            }
        }

        fn record(&self, call: String) {
            lock(&self.calls).push(call);
        }

        fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    impl JailProvider for Recorder {
        fn create(&self, spec: &JailSpec) -> Result<JailHandle> {
            self.record(format!("create {}", spec.name));
            if let Some(err) = self.script.create_err {
                return Err(err());
            }
            lock(&self.specs).push(spec.clone());
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(JailHandle::new(&spec.name, format!("/var/skiff/jails/{}", spec.name)))
        }

        fn provision(&self, handle: &mut JailHandle, release: &str) -> Result<()> {
            self.record(format!("provision {}", release));
            if self.script.provision_panics {
                panic!("release image corrupt");
            }
            if self.script.provision_err {
                return Err(Error::ReleaseNotFound(release.to_string()));
            }
            handle.jid = Some(7);
            Ok(())
        }

        fn execute(
            &self,
            _handle: &JailHandle,
            command: &str,
            timeout: Option<Duration>,
        ) -> Result<String> {
            self.record(format!("execute {}", command));
            if let Some(delay) = self.script.execute_delay {
                thread::sleep(delay);
            }
            match self.script.execute {
                Some(f) => f(command, timeout),
                None => Ok(String::new()),
            }
        }

        fn stop(&self, handle: &mut JailHandle, force: bool) -> Result<()> {
            self.record(format!("stop force={}", force));
            let attempt = self.stop_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.script.stop_failures {
                return Err(Error::JailOperation("jail_remove: EBUSY".into()));
            }
            handle.jid = None;
            Ok(())
        }

        fn destroy(&self, _handle: &JailHandle) -> Result<()> {
            self.record("destroy".to_string());
            self.live.fetch_sub(1, Ordering::SeqCst);
            if self.script.destroy_err {
                return Err(Error::Zfs("dataset is busy".into()));
            }
            Ok(())
        }
    }

    fn fast_config() -> SkiffConfig {
        let mut config = SkiffConfig::default();
        config.cleanup.base_delay_ms = 1;
        config.cleanup.max_delay_ms = 2;
        config.cleanup.max_attempts = 3;
        config.rate_limit.capacity = 1000.0;
        config.rate_limit.refill_per_sec = 1000.0;
        config
    }

    fn executor(script: Script) -> OneShotExecutor<Recorder> {
        OneShotExecutor::new(Recorder::with(script), &fast_config()).unwrap()
    }

    fn shell(command: &str, _timeout: Option<Duration>) -> Result<String> {
        match command {
            "echo hello" => Ok("hello\n".into()),
            "false" => Ok(String::new()),
            _ => Ok(format!("sh: {}: not found\n", command)),
        }
    }

    #[test]
    fn test_echo_hello() {
        let executor = executor(Script {
            execute: Some(shell),
            ..Default::default()
        });

        let outcome = executor.run_once("echo hello");
        assert_eq!(outcome, ExecutionOutcome::Success("hello\n".into()));
        assert_eq!(
            executor.provider().calls(),
            vec![
                "create one-shot",
                "provision 14.2-RELEASE",
                "execute echo hello",
                "stop force=true",
                "destroy",
            ]
        );
    }

    #[test]
    fn test_nonzero_exit_is_success() {
        let executor = executor(Script {
            execute: Some(shell),
            ..Default::default()
        });

        assert_eq!(executor.run_once("false"), ExecutionOutcome::Success(String::new()));
        assert_eq!(executor.provider().count("stop"), 1);
        assert_eq!(executor.provider().count("destroy"), 1);
    }

    #[test]
    fn test_name_collision_skips_cleanup() {
        let executor = executor(Script {
            create_err: Some(|| Error::JailAlreadyRunning("one-shot".into())),
            ..Default::default()
        });

        let outcome = executor.run_once("echo hello");
        assert!(matches!(
            outcome,
            ExecutionOutcome::CreationFailed(ref m) if m.contains("already running")
        ));
        assert_eq!(executor.provider().calls(), vec!["create one-shot"]);
    }

    #[test]
    fn test_provision_failure_still_cleans_up() {
        let executor = executor(Script {
            provision_err: true,
            ..Default::default()
        });

        let outcome = executor.run_once("echo hello");
        assert!(matches!(outcome, ExecutionOutcome::ProvisionFailed(ref m) if m.contains("14.2-RELEASE")));
        assert_eq!(
            executor.provider().calls(),
            vec!["create one-shot", "provision 14.2-RELEASE", "stop force=true", "destroy"]
        );
    }

    #[test]
    fn test_provider_panic_is_contained() {
        let executor = executor(Script {
            provision_panics: true,
            ..Default::default()
        });

        let outcome = executor.run_once("echo hello");
        assert!(matches!(
            outcome,
            ExecutionOutcome::ProvisionFailed(ref m) if m.contains("release image corrupt")
        ));
        assert_eq!(executor.provider().count("destroy"), 1);
    }

    #[test]
    fn test_execution_fault() {
        let executor = executor(Script {
            execute: Some(|_, _| {
                Err(Error::CommandFailed {
                    command: "jexec 7".into(),
                    message: "Process killed by signal SIGSEGV".into(),
                })
            }),
            ..Default::default()
        });

        let outcome = executor.run_once("crash");
        assert!(matches!(outcome, ExecutionOutcome::ExecutionFailed(ref m) if m.contains("SIGSEGV")));
        assert_eq!(executor.provider().count("stop"), 1);
        assert_eq!(executor.provider().count("destroy"), 1);
    }

    #[test]
    fn test_timeout_forces_stop() {
        let executor = executor(Script {
            execute: Some(|_, timeout| match timeout {
                Some(limit) => Err(Error::JailTimeout(limit)),
                None => Ok(String::new()),
            }),
            ..Default::default()
        });

        let outcome = executor.run_once_with_timeout("sleep 600", Some(Duration::from_secs(2)));
        assert!(matches!(outcome, ExecutionOutcome::ExecutionFailed(ref m) if m.contains("timeout")));

        let calls = executor.provider().calls();
        assert_eq!(&calls[3..], ["stop force=true", "destroy"]);
    }

    #[test]
    fn test_configured_timeout_is_passed() {
        let mut config = fast_config();
        config.oneshot.timeout_secs = 42;
        let executor = OneShotExecutor::new(
            Recorder::with(Script {
                execute: Some(|_, timeout| Ok(format!("{:?}", timeout))),
                ..Default::default()
            }),
            &config,
        )
        .unwrap();

        assert_eq!(executor.run_once("true").text(), "Some(42s)");
    }

    #[test]
    fn test_stop_failure_does_not_mask_outcome() {
        let executor = executor(Script {
            execute: Some(shell),
            stop_failures: usize::MAX,
            destroy_err: true,
            ..Default::default()
        });

        let outcome = executor.run_once("echo hello");
        assert_eq!(outcome, ExecutionOutcome::Success("hello\n".into()));
        assert!(executor.provider().count("stop") >= 1);
        assert!(executor.provider().count("destroy") >= 1);
    }

    #[test]
    fn test_transient_stop_failure_is_retried() {
        let executor = executor(Script {
            execute: Some(shell),
            stop_failures: 1,
            ..Default::default()
        });

        executor.run_once("echo hello");
        assert_eq!(executor.provider().count("stop"), 2);
        assert_eq!(executor.provider().count("destroy"), 1);
    }

    #[test]
    fn test_blank_command_never_reaches_provider() {
        let executor = executor(Script::default());

        assert_eq!(
            executor.run_once("   \n"),
            ExecutionOutcome::ExecutionFailed("empty command".into())
        );
        assert!(executor.provider().calls().is_empty());
    }

    #[test]
    fn test_serialized_runs_never_overlap() {
        let executor = executor(Script {
            execute_delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| executor.run_once("true"));
            }
        });

        assert_eq!(executor.provider().max_live.load(Ordering::SeqCst), 1);
        assert_eq!(executor.provider().count("destroy"), 4);
    }

    #[test]
    fn test_unique_runs_get_distinct_names_and_addresses() {
        let mut config = fast_config();
        config.oneshot.policy = LaunchPolicy::Unique;
        config.oneshot.network.pool = Some("10.0.1.0/24".into());
        let executor = OneShotExecutor::new(
            Recorder::with(Script {
                execute_delay: Some(Duration::from_millis(20)),
                ..Default::default()
            }),
            &config,
        )
        .unwrap();

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| executor.run_once("true"));
            }
        });

        let specs = lock(&executor.provider().specs).clone();
        let names: HashSet<_> = specs.iter().map(|s| s.name.clone()).collect();
        let addrs: HashSet<_> = specs.iter().map(|s| s.ipv4_address).collect();
        assert_eq!(specs.len(), 4);
        assert_eq!(names.len(), 4);
        assert_eq!(addrs.len(), 4);
        assert!(specs.iter().all(|s| s.name.starts_with("one-shot-")));
        assert!(!addrs.contains(&Ipv4Addr::new(10, 0, 1, 1)));

        // Every lease went back to the pool
        let pool = executor.pool.as_ref().unwrap();
        assert_eq!(lock(pool).allocated_count(), 1);
    }

    #[test]
    fn test_unique_requires_pool() {
        let mut config = fast_config();
        config.oneshot.policy = LaunchPolicy::Unique;
        assert!(OneShotExecutor::new(Recorder::default(), &config).is_err());
    }

    #[test]
    fn test_outcome_json() {
        let json = serde_json::to_string(&ExecutionOutcome::Success("hi\n".into())).unwrap();
        assert_eq!(json, r#"{"outcome":"success","text":"hi\n"}"#);

        let json = serde_json::to_string(&ExecutionOutcome::CreationFailed("x".into())).unwrap();
        assert_eq!(json, r#"{"outcome":"creation_failed","text":"x"}"#);
    }
}
