//! Shared state handed to every listener and background service

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::ClientConfig;

use crate::dialer::{Dialer, DialerPool, DirectDialer};
use crate::proxy::transport::Transport;
use crate::rules::RuleSet;
use crate::shutdown::ExitSignal;
use crate::tls::CertificateMinter;

pub struct ProxyContext {
    rules: ArcSwap<RuleSet>,
    pool: Arc<DialerPool>,
    remote: Transport,
    direct: Transport,
    minter: Arc<CertificateMinter>,
    exit: ExitSignal,
}

impl ProxyContext {
    /// Context whose pool starts out holding only a direct dialer
    pub fn new(minter: Arc<CertificateMinter>, tls: Arc<ClientConfig>, exit: ExitSignal) -> Self {
        let direct: Arc<dyn Dialer> = Arc::new(DirectDialer::default());
        let pool = Arc::new(DialerPool::new(direct.clone()));
        Self::with_dialers(pool, direct, minter, tls, exit)
    }

    pub fn with_dialers(
        pool: Arc<DialerPool>,
        direct: Arc<dyn Dialer>,
        minter: Arc<CertificateMinter>,
        tls: Arc<ClientConfig>,
        exit: ExitSignal,
    ) -> Self {
        Self {
            rules: ArcSwap::from_pointee(RuleSet::empty()),
            remote: Transport::new(pool.clone() as Arc<dyn Dialer>, tls.clone()),
            direct: Transport::new(direct, tls),
            pool,
            minter,
            exit,
        }
    }

    /// Snapshot of the active rule set; stays valid across a swap
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    pub fn set_rules(&self, rules: RuleSet) {
        self.rules.store(Arc::new(rules));
    }

    pub fn pool(&self) -> &Arc<DialerPool> {
        &self.pool
    }

    /// Transport over the upstream pool
    pub fn remote(&self) -> &Transport {
        &self.remote
    }

    /// Transport for traffic no rewrite applied to
    pub fn local(&self, rules: &RuleSet) -> &Transport {
        if rules.local_passthrough() {
            &self.direct
        } else {
            &self.remote
        }
    }

    pub fn minter(&self) -> &Arc<CertificateMinter> {
        &self.minter
    }

    pub fn exit(&self) -> &ExitSignal {
        &self.exit
    }
}
