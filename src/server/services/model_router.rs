use std::sync::Arc;

use super::gateway::ChatModel;
use super::modelscope::ModelScopeService;
use super::ollama::OllamaService;

/// Which generation backend a turn routes to. Selection is a pure function
/// of the two classifier flags so it can be tested without network clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelChoice {
    Local,
    Remote,
}

impl ModelChoice {
    pub fn display_name(self) -> &'static str {
        match self {
            ModelChoice::Local => "local-Qwen3-4B",
            ModelChoice::Remote => "remote-Qwen3-Next-80B",
        }
    }
}

/// Privacy-sensitive content never leaves the local boundary; only complex
/// and non-private turns escalate to the remote model. Crisis turns arrive
/// here already forced privacy-positive, so they always stay local.
pub fn choose(is_privacy_issue: bool, is_complex_issue: bool) -> ModelChoice {
    if is_privacy_issue {
        ModelChoice::Local
    } else if is_complex_issue {
        ModelChoice::Remote
    } else {
        ModelChoice::Local
    }
}

pub struct ModelRouter {
    local: Arc<OllamaService>,
    remote: Arc<ModelScopeService>,
}

impl ModelRouter {
    pub fn new(local: Arc<OllamaService>, remote: Arc<ModelScopeService>) -> Self {
        Self { local, remote }
    }

    pub fn service(&self, choice: ModelChoice) -> Arc<dyn ChatModel> {
        match choice {
            ModelChoice::Local => self.local.clone(),
            ModelChoice::Remote => self.remote.clone(),
        }
    }
}
