//! `a3s-diff token` command.

use a3s_diff_runtime::{
    fetch_token, fetch_token_with_oauth, generate_token_options, Challenge, TokenOptions,
};
use clap::Args;
use reqwest::header::HeaderMap;

#[derive(Args)]
pub struct TokenArgs {
    /// Token endpoint URL
    #[arg(long, required_unless_present = "challenge", conflicts_with = "challenge")]
    pub realm: Option<String>,

    /// WWW-Authenticate challenge returned by the registry
    #[arg(long)]
    pub challenge: Option<String>,

    /// Registry host, used for logging
    #[arg(long, default_value = "")]
    pub host: String,

    /// Service name to request a token for
    #[arg(long)]
    pub service: Option<String>,

    /// Scope to request (repeatable)
    #[arg(long = "scope")]
    pub scopes: Vec<String>,

    /// Registry username
    #[arg(short, long, default_value = "")]
    pub username: String,

    /// Password or refresh token
    #[arg(long, default_value = "")]
    pub secret: String,

    /// OAuth client id; switches to the OAuth POST flow
    #[arg(long)]
    pub client_id: Option<String>,
}

impl TokenArgs {
    fn token_options(&self) -> Result<TokenOptions, Box<dyn std::error::Error>> {
        let mut opts = match (&self.challenge, &self.realm) {
            (Some(header), _) => {
                let challenge = Challenge::parse(header)?;
                generate_token_options(&self.host, &self.username, &self.secret, &challenge)?
            }
            (None, Some(realm)) => TokenOptions {
                realm: realm.clone(),
                username: self.username.clone(),
                secret: self.secret.clone(),
                ..Default::default()
            },
            (None, None) => return Err("either --realm or --challenge is required".into()),
        };

        if let Some(service) = &self.service {
            opts.service = service.clone();
        }
        opts.scopes.extend(self.scopes.iter().cloned());
        Ok(opts)
    }
}

pub async fn execute(args: TokenArgs) -> Result<(), Box<dyn std::error::Error>> {
    let opts = args.token_options()?;
    let client = reqwest::Client::new();
    let headers = HeaderMap::new();

    let token = match &args.client_id {
        Some(client_id) => fetch_token_with_oauth(&client, &headers, client_id, &opts).await?,
        None => fetch_token(&client, &headers, &opts).await?,
    };
    println!("{}", token);
    Ok(())
}
