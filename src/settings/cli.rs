use super::Parser;

#[derive(Parser, Debug)]
pub struct Cli {
    #[arg(long)]
    pub settings: Option<String>,

    /// Conversation to join.
    #[arg(long, default_value = "1")]
    pub conversation: String,

    /// Log in with this pair instead of resuming the stored session.
    #[arg(long, requires = "refresh_token")]
    pub access_token: Option<String>,

    #[arg(long, requires = "access_token")]
    pub refresh_token: Option<String>,

    /// Send as a manager rather than a regular user.
    #[arg(long)]
    pub manager: bool,
}
