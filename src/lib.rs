//! 加密隧道客户端的路由决策与服务端远程解析
//!
//! 客户端对每个出站目标给出代理、直连或拦截的结论；服务端负责替客户端
//! 解析域名，并可按规则拦截。

pub mod acl;
pub mod block;
pub mod cache;
pub mod config;
pub mod dns;
pub mod domain;
pub mod error;
pub mod ip_matcher;
pub mod logger;
pub mod metrics;
pub mod remote;
pub mod router;
pub mod rule;
pub mod server;
pub mod transport;

pub use acl::AclRouter;
pub use block::BlockChecker;
pub use cache::DecisionCache;
pub use config::{Config, Policy};
pub use dns::LocalResolver;
pub use metrics::Metrics;
pub use remote::{PlainCodec, RemoteResolver, RequestCodec, ResolveFailure};
pub use router::{Outcome, Router, RoutingDecision, Verdict};
pub use rule::{RuleCheck, RuleCode, RuleMatcher};
pub use server::ResolverServer;
pub use transport::{HttpTransport, RoundTrip};
