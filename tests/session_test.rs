mod support;

use std::time::{Duration, SystemTime};

use anyhow::Result;
use http::Method;

use recache::{CacheBackend, CacheConfig, CachedSession, ExpireAfter};

use support::{MockClient, failing, ok, with_status};

fn session(client: MockClient, config: CacheConfig) -> CachedSession<MockClient> {
    CachedSession::new(client, CacheBackend::memory(config))
}

#[tokio::test]
async fn second_identical_get_is_served_from_cache() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/a", ok("hello"));
    let session = session(client, CacheConfig::new());

    let first = session.get("http://site.test/a").send().await?;
    assert!(!first.from_cache());
    assert_eq!(first.text(), "hello");

    let second = session.get("http://site.test/a").send().await?;
    assert!(second.from_cache());
    assert_eq!(second.text(), "hello");
    assert_eq!(session.client().requests(), 1);
    Ok(())
}

#[tokio::test]
async fn non_allowed_status_is_not_cached() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/missing", with_status(404, "nope"));
    let session = session(client, CacheConfig::new());

    session.get("http://site.test/missing").send().await?;
    let second = session.get("http://site.test/missing").send().await?;
    assert!(!second.from_cache());
    assert_eq!(session.client().requests(), 2);
    Ok(())
}

#[tokio::test]
async fn url_patterns_set_expiration_first_match_wins() -> Result<()> {
    let client = MockClient::new();
    client.route("http://api.example.com/x", ok("api"));
    client.route("http://example.com/static/y", ok("static"));
    client.route("http://other.com/z", ok("other"));

    let config = CacheConfig::new()
        .url_expire_after("*.example.com", ExpireAfter::from_secs(60))?
        .url_expire_after("example.com/static", ExpireAfter::from_secs(-1))?
        .expire_after(ExpireAfter::After(Duration::from_secs(10)));
    let session = session(client, config);

    let now = SystemTime::now();
    let api = session.get("http://api.example.com/x").send().await?;
    let expires = api.expires.expect("pattern sets an expiration");
    assert!(expires > now + Duration::from_secs(50));
    assert!(expires <= now + Duration::from_secs(70));

    let forever = session.get("http://example.com/static/y").send().await?;
    assert!(forever.expires.is_none());

    let fallback = session.get("http://other.com/z").send().await?;
    let expires = fallback.expires.expect("session default applies");
    assert!(expires <= now + Duration::from_secs(20));
    Ok(())
}

#[tokio::test]
async fn ignored_params_share_one_entry() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/?token=A", ok("payload"));
    let config = CacheConfig::new().ignored_params(&["token"]);
    let session = session(client, config);

    let first = session.get("http://site.test/?token=A").send().await?;
    assert!(!first.from_cache());

    // Different token, same fingerprint: no second network hit.
    let second = session.get("http://site.test/?token=B").send().await?;
    assert!(second.from_cache());
    assert_eq!(second.text(), "payload");
    assert_eq!(session.client().requests(), 1);
    Ok(())
}

#[tokio::test]
async fn response_no_store_is_not_written() -> Result<()> {
    let client = MockClient::new();
    client.route(
        "http://site.test/private",
        ok("secret").header("cache-control", "no-store"),
    );
    let session = session(client, CacheConfig::new().cache_control(true));

    session.get("http://site.test/private").send().await?;
    let second = session.get("http://site.test/private").send().await?;
    assert!(!second.from_cache());
    assert_eq!(session.client().requests(), 2);
    Ok(())
}

#[tokio::test]
async fn request_no_cache_skips_read_but_still_writes() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/a", ok("one"));
    let session = session(client, CacheConfig::new().cache_control(true));

    session.get("http://site.test/a").send().await?;
    let refetched = session
        .get("http://site.test/a")
        .header(
            http::header::CACHE_CONTROL,
            http::HeaderValue::from_static("no-cache"),
        )
        .send()
        .await?;
    assert!(!refetched.from_cache());
    assert_eq!(session.client().requests(), 2);

    // The rewritten entry serves later plain requests.
    let third = session.get("http://site.test/a").send().await?;
    assert!(third.from_cache());
    assert_eq!(session.client().requests(), 2);
    Ok(())
}

#[tokio::test]
async fn redirect_chain_is_aliased_to_the_final_response() -> Result<()> {
    let client = MockClient::new();
    client.route(
        "http://site.test/a",
        ok("landed").redirected("http://site.test/a", 302, "http://site.test/b"),
    );
    let session = session(client, CacheConfig::new());

    let first = session.get("http://site.test/a").send().await?;
    assert_eq!(first.url.as_str(), "http://site.test/b");
    assert_eq!(first.history.len(), 1);
    assert_eq!(first.history[0].status.as_u16(), 302);

    // A fresh request to the redirect source resolves through the alias.
    let second = session.get("http://site.test/a").send().await?;
    assert!(second.from_cache());
    assert_eq!(second.text(), "landed");
    assert_eq!(second.history.len(), 1);
    assert_eq!(session.client().requests(), 1);

    // The final URL is cached under its own fingerprint too; no route is
    // registered for it, so a miss would fail the request.
    let direct = session.get("http://site.test/b").send().await?;
    assert!(direct.from_cache());
    Ok(())
}

#[tokio::test]
async fn redirect_alias_resolves_when_headers_are_in_the_key() -> Result<()> {
    let client = MockClient::new();
    client.route(
        "http://site.test/a",
        ok("landed").redirected("http://site.test/a", 302, "http://site.test/b"),
    );
    let session = session(client, CacheConfig::new().include_headers(true));

    let first = session
        .get("http://site.test/a")
        .header(
            http::header::ACCEPT,
            http::HeaderValue::from_static("application/json"),
        )
        .send()
        .await?;
    assert!(!first.from_cache());

    // Same headers, same fingerprint: the alias written for the redirect
    // hop must carry the headers actually sent on it.
    let second = session
        .get("http://site.test/a")
        .header(
            http::header::ACCEPT,
            http::HeaderValue::from_static("application/json"),
        )
        .send()
        .await?;
    assert!(second.from_cache());
    assert_eq!(second.text(), "landed");
    assert_eq!(session.client().requests(), 1);

    // Different headers derive a different key and go back to the network.
    let other = session
        .get("http://site.test/a")
        .header(
            http::header::ACCEPT,
            http::HeaderValue::from_static("text/html"),
        )
        .send()
        .await?;
    assert!(!other.from_cache());
    assert_eq!(session.client().requests(), 2);
    Ok(())
}

#[tokio::test]
async fn not_modified_refreshes_the_cached_entry() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/r", ok("body-v1").header("etag", "\"v1\""));
    client.route("http://site.test/r", with_status(304, ""));
    let session = session(client, CacheConfig::new());

    let now = SystemTime::now();
    let first = session
        .get("http://site.test/r")
        .expire_after(ExpireAfter::At(now))
        .send()
        .await?;
    assert!(!first.from_cache());

    let second = session
        .get("http://site.test/r")
        .expire_after(ExpireAfter::After(Duration::from_secs(60)))
        .send()
        .await?;
    assert!(second.from_cache());
    assert_eq!(second.text(), "body-v1");
    assert_eq!(session.client().requests(), 2);

    // The revalidation request carried the stored validator.
    let headers = session.client().request_headers(1).unwrap();
    assert_eq!(
        headers.get(http::header::IF_NONE_MATCH).unwrap(),
        &http::HeaderValue::from_static("\"v1\"")
    );

    // The refreshed entry is fresh again: no third network hit.
    let third = session.get("http://site.test/r").send().await?;
    assert!(third.from_cache());
    assert_eq!(session.client().requests(), 2);
    Ok(())
}

#[tokio::test]
async fn stale_entry_is_served_when_the_network_fails() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/flaky", ok("golden"));
    client.route("http://site.test/flaky", failing());
    let session = session(client, CacheConfig::new().stale_if_error(true));

    let now = SystemTime::now();
    session
        .get("http://site.test/flaky")
        .expire_after(ExpireAfter::At(now))
        .send()
        .await?;

    let stale = session.get("http://site.test/flaky").send().await?;
    assert!(stale.from_cache());
    assert!(stale.is_expired());
    assert_eq!(stale.text(), "golden");
    Ok(())
}

#[tokio::test]
async fn transport_errors_propagate_without_stale_if_error() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/flaky", ok("golden"));
    client.route("http://site.test/flaky", failing());
    let session = session(client, CacheConfig::new());

    let now = SystemTime::now();
    session
        .get("http://site.test/flaky")
        .expire_after(ExpireAfter::At(now))
        .send()
        .await?;

    let err = session.get("http://site.test/flaky").send().await.unwrap_err();
    assert!(matches!(err, recache::Error::Transport(_)));
    Ok(())
}

#[tokio::test]
async fn disabled_scope_bypasses_reads_and_writes() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/a", ok("hello"));
    let session = session(client, CacheConfig::new());

    session.get("http://site.test/a").send().await?;
    assert_eq!(session.client().requests(), 1);

    {
        let _guard = session.disabled();
        let bypassed = session.get("http://site.test/a").send().await?;
        assert!(!bypassed.from_cache());
        assert_eq!(session.client().requests(), 2);
    }

    let cached = session.get("http://site.test/a").send().await?;
    assert!(cached.from_cache());
    assert_eq!(session.client().requests(), 2);
    Ok(())
}

#[tokio::test]
async fn refresh_skips_the_read_but_updates_the_entry() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/a", ok("one"));
    client.route("http://site.test/a", ok("two"));
    let session = session(client, CacheConfig::new());

    session.get("http://site.test/a").send().await?;
    let refreshed = session.get("http://site.test/a").refresh().send().await?;
    assert!(!refreshed.from_cache());
    assert_eq!(refreshed.text(), "two");

    let cached = session.get("http://site.test/a").send().await?;
    assert!(cached.from_cache());
    assert_eq!(cached.text(), "two");
    assert_eq!(session.client().requests(), 2);
    Ok(())
}

#[tokio::test]
async fn per_request_expiration_beats_the_session_default() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/a", ok("one"));
    client.route("http://site.test/a", ok("two"));
    let session = session(client, CacheConfig::new());

    let now = SystemTime::now();
    session
        .get("http://site.test/a")
        .expire_after(ExpireAfter::At(now))
        .send()
        .await?;

    // Expired immediately: the next request revalidates over the network.
    let second = session.get("http://site.test/a").send().await?;
    assert!(!second.from_cache());
    assert_eq!(session.client().requests(), 2);
    Ok(())
}

#[tokio::test]
async fn cookies_are_restored_on_cache_hits() -> Result<()> {
    let client = MockClient::new();
    client.route(
        "http://site.test/login",
        ok("welcome").header("set-cookie", "session=abc123; Path=/"),
    );
    let session = session(client, CacheConfig::new());

    session.get("http://site.test/login").send().await?;
    session.get("http://site.test/login").send().await?;

    let stored = session.client().stored_cookies();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].1[0].name, "session");
    assert_eq!(stored[1].1[0].value, "abc123");
    assert_eq!(session.client().requests(), 1);
    Ok(())
}

#[tokio::test]
async fn expired_entries_are_removed_by_maintenance() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/a", ok("short"));
    client.route("http://site.test/b", ok("long"));
    let session = session(client, CacheConfig::new());

    let now = SystemTime::now();
    session
        .get("http://site.test/a")
        .expire_after(ExpireAfter::At(now))
        .send()
        .await?;
    session.get("http://site.test/b").send().await?;

    let removed = session.delete_expired_responses().await?;
    assert_eq!(removed, 1);
    assert!(session.cache().has_url(Method::GET, "http://site.test/b").await?);
    assert!(!session.cache().has_url(Method::GET, "http://site.test/a").await?);
    Ok(())
}

#[tokio::test]
async fn runtime_default_expiration_applies_to_new_requests() -> Result<()> {
    let client = MockClient::new();
    client.route("http://site.test/a", ok("x"));
    let session = session(client, CacheConfig::new());

    session.set_expire_after(ExpireAfter::After(Duration::from_secs(30)));
    let response = session.get("http://site.test/a").send().await?;
    assert!(response.expires.is_some());
    Ok(())
}

#[tokio::test]
async fn sessions_stack_as_http_clients() -> Result<()> {
    use recache::session::HttpClient;

    let client = MockClient::new();
    client.route("http://site.test/a", ok("hello"));
    let inner = session(client, CacheConfig::new());
    // An outer wrapper (e.g. retries) can drive the cached session through
    // the same seam it would use for a bare client.
    let request = recache::Request::get("http://site.test/a")?;
    let first = inner.execute(&request).await.map_err(|err| anyhow::anyhow!(err))?;
    assert_eq!(first.status.as_u16(), 200);
    let second = inner.execute(&request).await.map_err(|err| anyhow::anyhow!(err))?;
    assert_eq!(second.body.as_ref(), b"hello");
    assert_eq!(inner.client().requests(), 1);
    Ok(())
}
