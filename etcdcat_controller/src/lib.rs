#![recursion_limit = "1024"]

use std::sync::Arc;

use kube::Client;

pub mod errors;
pub use errors::{Error, RequeueError, Result};

/// Environment-driven controller settings
pub mod config;
pub use config::Config;

/// Create/delete bookkeeping between issuing a write and seeing it back
pub mod expectations;
pub use expectations::Expectations;

/// Ownership, finalizer and patch helpers over the kube client
pub mod k8s;

/// The EtcdCluster reconciler and its child-resource helpers
pub mod cluster;

/// Roll-out engine translating one deployment into a chain of node sets
pub mod nodedeployment;

/// Fan-out/fan-in of EtcdNodes from one template
pub mod nodeset;

/// The per-node lifecycle: service, user-data, VM, SSH, health
pub mod node;

/// The observer that health-checks clusters and members over mutual TLS
pub mod prober;

/// State shared by every controller in the process.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<Config>,
    /// Raised by deployments awaiting node-set creation events
    pub set_expectations: Arc<Expectations>,
    /// Raised by node sets awaiting node create/delete events
    pub node_expectations: Arc<Expectations>,
}

impl Context {
    pub fn new(client: Client, config: Config) -> Context {
        Context {
            client,
            config: Arc::new(config),
            set_expectations: Arc::new(Expectations::default()),
            node_expectations: Arc::new(Expectations::default()),
        }
    }
}
