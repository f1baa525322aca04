pub mod access_log;
pub mod connect;
pub mod listener;
pub mod mitm;
pub mod pipeline;
pub mod upgrade;
pub mod wire;
pub mod ws;

use std::sync::Arc;

use crate::cert::CertStore;
use crate::client::Client;
use crate::config::Config;
use crate::interceptor;
use crate::interceptor::InterceptorBudget;
use crate::middleware;
use crate::middleware::MiddlewareBudget;
use mitm::MitmPolicy;
use pipeline::RequestContext;
use ws::MessageInterceptors;

/// Everything the HTTP pipeline, CONNECT state machine and upgrade path need
/// in order to serve one accepted connection. Built once by `Engine` and
/// shared (by reference) across every connection task.
pub struct ProxyShared {
	pub client: Arc<Client>,
	pub cert_store: Arc<CertStore>,
	pub mitm_policy: MitmPolicy,
	pub middleware: middleware::Chain<RequestContext>,
	pub middleware_budget: MiddlewareBudget,
	pub interceptor: interceptor::Chain<RequestContext>,
	pub interceptor_budget: InterceptorBudget,
	pub message_interceptors: Arc<MessageInterceptors>,
	pub max_body_buffer: usize,
	pub config: Config,
}
