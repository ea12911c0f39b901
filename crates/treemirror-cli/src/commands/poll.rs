//! Wait for a pending sync result, either straight from the state database or
//! through a running server.

use super::{open_db, with_admin_context};
use anyhow::{Context, Result, anyhow};
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder};
use treemirror_core::config::Config;
use treemirror_core::nonce;
use treemirror_server::http::NonceResponse;
use treemirror_sync::endpoints::{self, CompletionReport, StatusReport};
use treemirror_sync::poll::{PollState, PollingClient, drive};

pub fn run_local(config: &Config, slug: &str) -> Result<()> {
    let conn = open_db(config)?;
    let client = with_admin_context(config, &conn, |actor, ctx| {
        let status = endpoints::status(&ctx, slug)?;
        let token = actor
            .nonce_for(&nonce::poll_action(slug))
            .context("Local operator cannot mint nonces")?;
        let mut client = PollingClient::from_config(&config.poll);
        client.start(&status);
        let mut source = || endpoints::poll_completion(&ctx, slug, &token);
        drive(&mut client, &mut source, || {
            std::thread::sleep(config.poll.interval())
        });
        Ok(client)
    })?;
    report(&client);
    Ok(())
}

pub fn run_remote(config: &Config, server: &str, token: Option<&str>, slug: &str) -> Result<()> {
    let base = Url::parse(server).with_context(|| format!("Invalid server URL: {server}"))?;
    let http = Client::new();
    let authed = |builder: RequestBuilder| match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    };

    let status: StatusReport = authed(http.get(entity_url(&base, slug, "status")?))
        .send()
        .context("Failed to reach server")?
        .error_for_status()?
        .json()?;
    let mut client = PollingClient::from_config(&config.poll);
    client.start(&status);
    if matches!(client.state(), PollState::Idle) {
        report(&client);
        return Ok(());
    }

    let nonces: NonceResponse = authed(http.get(entity_url(&base, slug, "nonce")?))
        .send()?
        .error_for_status()
        .context("Server refused to issue a poll nonce; check --token")?
        .json()?;
    let body = serde_json::json!({ "nonce": nonces.poll_nonce });
    let poll_url = entity_url(&base, slug, "poll")?;
    let mut source = || -> Result<CompletionReport, reqwest::Error> {
        authed(http.post(poll_url.clone()))
            .json(&body)
            .send()?
            .error_for_status()?
            .json()
    };
    drive(&mut client, &mut source, || {
        std::thread::sleep(config.poll.interval())
    });
    report(&client);
    Ok(())
}

/// `{base}/entities/{slug}/{action}`, with the slug encoded as one path segment.
fn entity_url(base: &Url, slug: &str, action: &str) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| anyhow!("Server URL cannot take a path: {base}"))?
        .pop_if_empty()
        .extend(["entities", slug, action]);
    Ok(url)
}

fn report(client: &PollingClient) {
    let rendered = client.render();
    println!("{}", rendered.message);
    if rendered.show_override {
        println!("Override is available: `treemirror override <slug>`.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::entity::save_tree;
    use crate::commands::init;
    use crate::commands::test_support::config_in;
    use treemirror_core::types::SourceItem;
    use treemirror_state::entities;

    #[test]
    fn entity_url_keeps_slug_in_one_segment() {
        let base = Url::parse("http://127.0.0.1:7070/").unwrap();
        assert_eq!(
            entity_url(&base, "docs", "status").unwrap().as_str(),
            "http://127.0.0.1:7070/entities/docs/status"
        );
        assert_eq!(
            entity_url(&base, "a/b?c#d", "poll").unwrap().as_str(),
            "http://127.0.0.1:7070/entities/a%2Fb%3Fc%23d/poll"
        );

        let prefixed = Url::parse("http://host/api").unwrap();
        assert_eq!(
            entity_url(&prefixed, "docs", "nonce").unwrap().as_str(),
            "http://host/api/entities/docs/nonce"
        );
        let opaque = Url::parse("mailto:ops@example.com").unwrap();
        assert!(entity_url(&opaque, "docs", "status").is_err());
    }

    #[test]
    fn local_poll_consumes_completion() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        init::run(&config, true).unwrap();
        let conn = open_db(&config).unwrap();
        entities::create_entity(&conn, "docs", "Docs").unwrap();
        save_tree(&config, &conn, "docs", &[SourceItem::new(1, "Intro", "/intro")]).unwrap();

        run_local(&config, "docs").unwrap();

        // Completion is take-once: a second poll finds nothing to wait for.
        let after = with_admin_context(&config, &conn, |_, ctx| {
            Ok(endpoints::status(&ctx, "docs")?)
        })
        .unwrap();
        assert!(!after.poll);
    }
}
