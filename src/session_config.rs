//! Immutable per-session configuration
//!
//! Built once when the interview starts from the user's free-text context.

/// Errors in the configuration needed to start a session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Interview context is empty")]
    EmptyContext,
    #[error("No model configured")]
    MissingModel,
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),
    #[error("API key not configured. Set GEMINI_API_KEY environment variable.")]
    MissingApiKey,
    #[error("Settings error: {0}")]
    Settings(String),
}

/// Model, system instruction and sample rate for one live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    model: String,
    system_instruction: String,
    sample_rate: u32,
}

impl SessionConfig {
    /// Validate inputs and build the system instruction from `context`
    pub fn new(model: &str, context: &str, sample_rate: u32) -> Result<Self, ConfigError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(ConfigError::MissingModel);
        }
        if context.trim().is_empty() {
            return Err(ConfigError::EmptyContext);
        }
        if sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(sample_rate));
        }

        Ok(Self {
            model: model.to_string(),
            system_instruction: system_instruction(context),
            sample_rate,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Hiring-manager persona with the candidate's context embedded verbatim
pub fn system_instruction(context: &str) -> String {
    format!(
        "You are a professional hiring manager conducting a job interview. \
         Context provided by candidate: \"{}\". \
         Start by introducing yourself and asking a relevant question. \
         Keep your responses concise and conversational.",
        context
    )
}
