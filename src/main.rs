//! MCP Delegated Auth - operator tool
//!
//! Verifies bearer tokens and performs On-Behalf-Of exchanges with the same
//! configuration an MCP server would use.

use std::process::ExitCode;

use clap::Parser;
use serde_json::json;
use tracing::error;

use mcp_delegated_auth::{
    AuthService,
    cli::{Cli, Command, token_argument},
    config::{Config, ResolvedAuthConfig},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    let format = cli.log_format.as_deref().unwrap_or(&config.log.format);
    if let Err(e) = setup_tracing(level, Some(format)) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let resolved = match config.resolved_auth() {
        Ok(Some(resolved)) => resolved,
        Ok(None) => {
            println!("Authentication is disabled (auth.enabled = false)");
            return match cli.command {
                Command::CheckConfig => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::CheckConfig => run_check_config(&resolved),
        Command::Verify { token } => match build_service(&resolved) {
            Some(service) => run_verify(&service, token_argument(&token)).await,
            None => ExitCode::FAILURE,
        },
        Command::Exchange {
            token,
            scope,
            raw,
            show_token,
        } => match build_service(&resolved) {
            Some(service) => {
                run_exchange(&service, token_argument(&token), scope.as_deref(), raw, show_token)
                    .await
            }
            None => ExitCode::FAILURE,
        },
    }
}

fn build_service(resolved: &ResolvedAuthConfig) -> Option<AuthService> {
    AuthService::from_config(resolved)
        .inspect_err(|e| error!(error = %e, "Failed to build auth service"))
        .ok()
}

fn run_check_config(resolved: &ResolvedAuthConfig) -> ExitCode {
    println!("✅ Configuration valid");
    println!("   Tenant:           {}", resolved.tenant_id);
    println!("   Client ID:        {}", resolved.client_id);
    println!("   Issuer:           {}", resolved.issuer);
    println!("   Audience:         {}", resolved.audience);
    println!("   JWKS URI:         {}", resolved.jwks_uri);
    println!("   Token endpoint:   {}", resolved.token_endpoint);
    println!("   Downstream scope: {}", resolved.downstream_scope);
    println!("   Credential:       {}", resolved.credential.name());
    ExitCode::SUCCESS
}

async fn run_verify(service: &AuthService, token: &str) -> ExitCode {
    match service.verify(token).await {
        Ok(identity) => match serde_json::to_string_pretty(&identity) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ Failed to serialize identity: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("❌ Token rejected ({}): {e}", e.kind());
            if e.is_retryable() {
                eprintln!("💡 The identity authority was unreachable; retry later");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run_exchange(
    service: &AuthService,
    token: &str,
    scope: Option<&str>,
    raw: bool,
    show_token: bool,
) -> ExitCode {
    let outcome = if raw {
        service.exchange_assertion(token, scope).await
    } else {
        match service.verify(token).await {
            Ok(identity) => service.exchange(&identity, scope).await,
            Err(e) => {
                eprintln!("❌ Token rejected ({}): {e}", e.kind());
                return ExitCode::FAILURE;
            }
        }
    };

    match outcome {
        Ok(result) => {
            let access_token = if show_token {
                result.access_token.clone()
            } else {
                "<redacted>".to_string()
            };
            let out = json!({
                "access_token": access_token,
                "expires_at": result.expires_at,
                "token_type": result.token_type,
                "scope": result.scope,
            });
            println!("{out:#}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Exchange failed ({}): {e}", e.kind());
            if e.requires_reauthentication() {
                eprintln!("💡 Sign in again to obtain a fresh token");
            } else if e.is_retryable() {
                eprintln!("💡 Transient failure; retry later");
            }
            ExitCode::FAILURE
        }
    }
}
