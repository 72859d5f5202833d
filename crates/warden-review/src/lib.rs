//! Concrete backends for the executor's capabilities.
//!
//! - [`reviewer::LlmReviewer`]: chunk review over an OpenAI-compatible API
//! - [`source::RoutingDiffSource`]: GitHub, GitLab or Gitee compare APIs, or
//!   local `git2` diffs
//! - [`channels`]: log, webhook, WeChat Work and GitHub commit-comment
//!   notification transports, plus SMTP email

pub mod channels;
pub mod forge;
pub mod github;
pub mod llm;
pub mod local;
pub mod prompt;
pub mod reviewer;
pub mod source;
