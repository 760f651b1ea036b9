//! Shared fixtures for the orchestration integration tests.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use llm_failover::{
    CallOrchestrator, EnvironmentConfig, PreparedInput, ProbeResult, ProviderAdapter,
    ProviderCatalog, ProviderId,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const PRIMARY: &str = "primary-llm";
pub const GATEWAY: &str = "enterprise-gateway";
pub const COMMUNITY: &str = "community-inference";
pub const LOCAL: &str = "local-inference";

/// Adapter whose call and probe outcomes are set by the test.
pub struct ScriptedAdapter {
    id: ProviderId,
    configured: bool,
    max_tokens: u32,
    reachable: AtomicBool,
    always_fail: Mutex<Option<String>>,
    queued_failures: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    probes: AtomicUsize,
    received: Mutex<Vec<(PreparedInput, u32)>>,
}

impl ScriptedAdapter {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, true, 128_000))
    }

    pub fn unconfigured(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, false, 128_000))
    }

    pub fn with_max_tokens(id: &str, max_tokens: u32) -> Arc<Self> {
        Arc::new(Self::build(id, true, max_tokens))
    }

    fn build(id: &str, configured: bool, max_tokens: u32) -> Self {
        Self {
            id: ProviderId::new(id),
            configured,
            max_tokens,
            reachable: AtomicBool::new(true),
            always_fail: Mutex::new(None),
            queued_failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails with `message` until cleared.
    pub fn fail_with(&self, message: &str) {
        *self.always_fail.lock() = Some(message.to_string());
    }

    /// The next `times` calls fail with `message`, then calls succeed.
    pub fn fail_times(&self, times: usize, message: &str) {
        let mut queue = self.queued_failures.lock();
        for _ in 0..times {
            queue.push_back(message.to_string());
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<(PreparedInput, u32)> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn required_credential_names(&self) -> Vec<String> {
        vec![format!("{}_API_KEY", self.id.as_str().to_uppercase().replace('-', "_"))]
    }

    fn check_configured(&self) -> bool {
        self.configured
    }

    fn model_max_tokens(&self) -> u32 {
        self.max_tokens
    }

    async fn check_reachable(&self) -> Result<ProbeResult> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(if self.reachable.load(Ordering::SeqCst) {
            ProbeResult::reachable(20)
        } else {
            ProbeResult::unreachable(20)
        })
    }

    async fn call(&self, input: &PreparedInput, max_output_tokens: u32) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.received.lock().push((input.clone(), max_output_tokens));

        if let Some(message) = self.always_fail.lock().clone() {
            return Err(anyhow!(message));
        }
        if let Some(message) = self.queued_failures.lock().pop_front() {
            return Err(anyhow!(message));
        }
        Ok(format!("{} answer #{}", self.id, call))
    }
}

pub fn reference_config() -> EnvironmentConfig {
    EnvironmentConfig::new(PRIMARY).with_fallbacks([GATEWAY, COMMUNITY, LOCAL])
}

pub struct Fixture {
    pub orchestrator: CallOrchestrator,
    pub primary: Arc<ScriptedAdapter>,
    pub gateway: Arc<ScriptedAdapter>,
    pub community: Arc<ScriptedAdapter>,
    pub local: Arc<ScriptedAdapter>,
}

impl Fixture {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self::with_adapters(
            config,
            ScriptedAdapter::new(PRIMARY),
            ScriptedAdapter::new(GATEWAY),
            ScriptedAdapter::new(COMMUNITY),
            ScriptedAdapter::new(LOCAL),
        )
    }

    pub fn with_adapters(
        config: EnvironmentConfig,
        primary: Arc<ScriptedAdapter>,
        gateway: Arc<ScriptedAdapter>,
        community: Arc<ScriptedAdapter>,
        local: Arc<ScriptedAdapter>,
    ) -> Self {
        let mut catalog = ProviderCatalog::new();
        for adapter in [&primary, &gateway, &community, &local] {
            catalog
                .register(adapter.clone())
                .expect("unique provider ids");
        }
        let orchestrator = CallOrchestrator::new(catalog, config).expect("valid config");
        Self {
            orchestrator,
            primary,
            gateway,
            community,
            local,
        }
    }

    pub fn fallback_calls(&self) -> usize {
        self.gateway.calls() + self.community.calls() + self.local.calls()
    }
}

pub fn id(name: &str) -> ProviderId {
    ProviderId::new(name)
}

pub fn prompt(text: &str) -> PreparedInput {
    PreparedInput::new().with_user(text)
}
