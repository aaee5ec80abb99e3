use std::env;

pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";

/// Get the OpenAI API key from the environment. Empty values count as unset.
pub fn get_env_api_key() -> Option<String> {
    non_empty_var(OPENAI_API_KEY)
}

/// Base URL override, e.g. for an OpenAI-compatible gateway.
pub fn get_env_base_url() -> Option<String> {
    non_empty_var(OPENAI_BASE_URL)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
