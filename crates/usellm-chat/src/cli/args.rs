pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

#[derive(Debug, Clone, Default)]
pub struct Args {
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub raw: bool,
    pub help: bool,
    pub version: bool,
    pub messages: Vec<String>,
}

impl Args {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// Positional arguments joined into one user prompt.
    pub fn prompt(&self) -> String {
        self.messages.join(" ")
    }
}

pub fn parse_args(args: &[String]) -> Args {
    let mut result = Args::default();
    let mut i = 0;

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => result.help = true,
            "--version" | "-v" => result.version = true,
            "--model" | "-m" if i + 1 < args.len() => {
                i += 1;
                result.model = Some(args[i].clone());
            }
            "--api-key" if i + 1 < args.len() => {
                i += 1;
                result.api_key = Some(args[i].clone());
            }
            "--base-url" if i + 1 < args.len() => {
                i += 1;
                result.base_url = Some(args[i].clone());
            }
            "--system" | "--system-prompt" if i + 1 < args.len() => {
                i += 1;
                result.system_prompt = Some(args[i].clone());
            }
            "--temperature" if i + 1 < args.len() => {
                i += 1;
                result.temperature = args[i].parse().ok();
            }
            "--raw" => result.raw = true,
            v if !v.starts_with('-') => result.messages.push(v.to_string()),
            _ => {}
        }

        i += 1;
    }

    result
}

pub fn print_help(bin_name: &str) {
    println!(
        "{bin_name} - stream a chat completion to stdout\n\n\
         Usage:\n  {bin_name} [options] <message...>\n  echo <message> | {bin_name} [options]\n\n\
         Options:\n  --model, -m <name>      (default {DEFAULT_MODEL})\n  --api-key <key>         (default $OPENAI_API_KEY)\n  --base-url <url>        (default $OPENAI_BASE_URL or https://api.openai.com/v1/)\n  --system <text>\n  --temperature <float>\n  --raw                   read the body as plain text instead of SSE\n  --help, -h\n  --version, -v\n\n\
         Logging:\n  RUST_LOG=debug {bin_name} ..."
    );
}
