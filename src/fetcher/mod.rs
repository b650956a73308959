//! Blocking HTTP client bound to one worker.
//!
//! The client is built once from the worker's network configuration and
//! rebuilt from the same configuration on [`Fetcher::reset`] after a
//! transport error. Configured options the library cannot express are
//! reported as warnings at build time.

pub mod config;

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

pub use self::config::{HttpVersion, NetworkConfig};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid network configuration: {0}")]
    Config(String),
    #[error("HTTP status {0} is configured as retriable")]
    RetriableStatus(u16),
    #[error("redirection error: {0}")]
    Redirect(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// One fetched response, body already repaired to valid UTF-8.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub body: String,
    pub status: u16,
    /// Lowercased, whitespace-stripped content type.
    pub content_type: String,
}

pub struct Fetcher {
    client: Client,
    config: NetworkConfig,
}

impl Fetcher {
    /// Build a client from a network configuration. Returns the fetcher and
    /// the warnings for unsupported options.
    pub fn new(config: NetworkConfig) -> Result<(Self, Vec<String>), FetchError> {
        let (client, warnings) = build_client(&config)?;
        Ok((Self { client, config }, warnings))
    }

    /// Perform one GET request.
    ///
    /// Statuses listed in `retry_codes` surface as
    /// [`FetchError::RetriableStatus`]; every other status (including errors
    /// in [400, 600)) is returned to the caller for its own policy.
    pub fn fetch(&self, url: &str, retry_codes: &[u64]) -> Result<FetchedResponse, FetchError> {
        let response = self.client.get(url).send().map_err(|e| {
            if e.is_redirect() {
                FetchError::Redirect(e.to_string())
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if retry_codes.contains(&(status as u64)) {
            return Err(FetchError::RetriableStatus(status));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase()
            .split_whitespace()
            .collect::<String>();

        let bytes = response
            .bytes()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let body = if content_type.contains("charset=iso-8859-1")
            || content_type.contains("charset=latin1")
        {
            // ISO-8859-1 maps bytes to the first 256 code points one-to-one
            bytes.iter().map(|&b| b as char).collect()
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };

        Ok(FetchedResponse {
            body,
            status,
            content_type,
        })
    }

    /// Dispose the underlying client and rebuild it with the previously
    /// applied configuration, after a backoff.
    pub fn reset(&mut self, backoff: Duration) -> Result<(), FetchError> {
        std::thread::sleep(backoff);
        let (client, _) = build_client(&self.config)?;
        self.client = client;
        Ok(())
    }
}

fn unsupported(warnings: &mut Vec<String>, key: &str) {
    warnings.push(format!(
        "network option '{key}' is not supported by the HTTP client"
    ));
}

fn build_client(config: &NetworkConfig) -> Result<(Client, Vec<String>), FetchError> {
    let mut warnings = Vec::new();

    let mut builder = Client::builder()
        .pool_max_idle_per_host(config.connections_max as usize)
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .timeout(Duration::from_secs(config.request_timeout))
        .gzip(config.encoding_gzip)
        .brotli(config.encoding_br)
        .referer(config.referer_automatic)
        .tcp_nodelay(!config.tcp_nagle)
        .connection_verbose(config.verbose);

    if config.cookies {
        builder = builder.cookie_store(true);
        if !config.cookies_load.is_empty() || !config.cookies_save.is_empty() {
            unsupported(&mut warnings, "cookies.load/cookies.save (persistent cookie files)");
        }
    }

    let mut headers = HeaderMap::new();
    for header in &config.headers {
        match parse_header(header) {
            Some((name, value)) => {
                headers.insert(name, value);
            }
            None => warnings.push(format!("ignored malformed header '{header}'")),
        }
    }
    if !config.cookies_set.is_empty() {
        match HeaderValue::from_str(&config.cookies_set) {
            Ok(value) => {
                headers.insert(reqwest::header::COOKIE, value);
            }
            Err(_) => warnings.push("ignored malformed 'cookies.set' value".to_string()),
        }
    }
    if !config.referer.is_empty() {
        match HeaderValue::from_str(&config.referer) {
            Ok(value) => {
                headers.insert(reqwest::header::REFERER, value);
            }
            Err(_) => warnings.push("ignored malformed 'referer' value".to_string()),
        }
    }
    if !headers.is_empty() {
        builder = builder.default_headers(headers);
    }

    match config.http_version {
        HttpVersion::Any => {}
        HttpVersion::V10 | HttpVersion::V11 => builder = builder.http1_only(),
        HttpVersion::V2 | HttpVersion::V2PriorKnowledge => {
            builder = builder.http2_prior_knowledge()
        }
        HttpVersion::V2Tls => unsupported(&mut warnings, "http.version=2-TLS"),
    }

    for resolve in &config.dns_resolves {
        // HOST:PORT:ADDRESS, the only DNS override the client supports
        let parts: Vec<&str> = resolve.splitn(3, ':').collect();
        match (
            parts.as_slice(),
            parts.get(2).and_then(|a| a.parse::<std::net::IpAddr>().ok()),
        ) {
            ([host, port, _], Some(addr)) => {
                let port: u16 = port.parse().unwrap_or(0);
                builder = builder.resolve(host, std::net::SocketAddr::new(addr, port));
            }
            _ => warnings.push(format!("ignored malformed dns.resolves entry '{resolve}'")),
        }
    }
    if !config.dns_doh.is_empty() {
        unsupported(&mut warnings, "dns.doh");
    }
    if !config.dns_interface.is_empty() {
        unsupported(&mut warnings, "dns.interface");
    }
    if !config.dns_servers.is_empty() {
        unsupported(&mut warnings, "dns.servers");
    }
    if config.dns_shuffle {
        unsupported(&mut warnings, "dns.shuffle");
    }

    if !config.local_interface.is_empty() {
        match config.local_interface.parse::<std::net::IpAddr>() {
            Ok(addr) => builder = builder.local_address(Some(addr)),
            Err(_) => unsupported(&mut warnings, "local.interface (only literal addresses are supported)"),
        }
    }
    if config.local_port != 0 || config.local_port_range != 1 {
        unsupported(&mut warnings, "local.port/local.portrange");
    }

    if !config.proxy.is_empty() {
        let mut proxy = reqwest::Proxy::all(&config.proxy)
            .map_err(|e| FetchError::Config(format!("invalid proxy '{}': {e}", config.proxy)))?;
        if !config.proxy_auth.is_empty() {
            match config.proxy_auth.split_once(':') {
                Some((user, password)) => proxy = proxy.basic_auth(user, password),
                None => warnings.push("ignored malformed 'proxy.auth' value".to_string()),
            }
        }
        builder = builder.proxy(proxy);
        if !config.proxy_headers.is_empty() {
            unsupported(&mut warnings, "proxy.headers");
        }
        if !config.proxy_pre.is_empty() {
            unsupported(&mut warnings, "proxy.pre");
        }
        if !config.proxy_tls_srp_user.is_empty() || !config.proxy_tls_srp_password.is_empty() {
            unsupported(&mut warnings, "proxy.tlssrp.*");
        }
        if config.proxy_tunnelling {
            unsupported(&mut warnings, "proxy.tunnelling");
        }
        if !config.ssl_verify_proxy_host || !config.ssl_verify_proxy_peer {
            unsupported(&mut warnings, "ssl.verify.proxy.*");
        }
    }

    if config.redirect {
        let max = if config.redirect_max < 0 {
            usize::MAX
        } else {
            config.redirect_max as usize
        };
        builder = builder.redirect(reqwest::redirect::Policy::limited(max));
    } else {
        builder = builder.redirect(reqwest::redirect::Policy::none());
    }
    if config.redirect_post301 || config.redirect_post302 || config.redirect_post303 {
        unsupported(&mut warnings, "redirect.post301/302/303");
    }

    if config.speed_down_limit != 0
        || config.speed_up_limit != 0
        || config.speed_low_limit != 0
        || config.speed_low_time != 0
    {
        unsupported(&mut warnings, "speed.*");
    }

    if !config.ssl_verify_peer {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if !config.ssl_verify_host {
        unsupported(&mut warnings, "ssl.verify.host (peer verification covers the host name)");
    }
    if config.ssl_verify_status {
        unsupported(&mut warnings, "ssl.verify.status");
    }

    if config.tcp_fast_open {
        unsupported(&mut warnings, "tcp.fastopen");
    }
    if config.tcp_keep_alive {
        builder = builder.tcp_keepalive(Some(Duration::from_secs(config.tcp_keep_alive_idle)));
    }
    if config.happy_eyeballs_timeout != 0 {
        unsupported(&mut warnings, "timeout.happyeyeballs");
    }
    if !config.tls_srp_user.is_empty() || !config.tls_srp_password.is_empty() {
        unsupported(&mut warnings, "tlssrp.*");
    }
    if config.content_length_ignore {
        unsupported(&mut warnings, "contentlength.ignore");
    }
    if config.dns_cache_timeout != NetworkConfig::default().dns_cache_timeout {
        unsupported(&mut warnings, "dns.cachetimeout");
    }
    if config.encoding_deflate {
        unsupported(&mut warnings, "encoding.deflate");
    }
    if config.encoding_transfer {
        unsupported(&mut warnings, "encoding.transfer");
    }

    if !config.user_agent.is_empty() {
        builder = builder.user_agent(config.user_agent.clone());
    }

    let client = builder
        .build()
        .map_err(|e| FetchError::Config(e.to_string()))?;
    Ok((client, warnings))
}

fn parse_header(header: &str) -> Option<(HeaderName, HeaderValue)> {
    let (name, value) = header.split_once(':')?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
    let value = HeaderValue::from_str(value.trim()).ok()?;
    Some((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> Fetcher {
        Fetcher::new(NetworkConfig::default()).unwrap().0
    }

    #[test]
    fn fetch_reports_status_and_content_type() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_header("Content-Type", "Text/HTML; Charset=UTF-8")
            .with_body("<html>ok</html>")
            .create();

        let response = fetcher()
            .fetch(&format!("{}/page", server.url()), &[])
            .unwrap();
        mock.assert();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "text/html;charset=utf-8");
        assert_eq!(response.body, "<html>ok</html>");
    }

    #[test]
    fn retriable_status_is_an_error() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/busy")
            .with_status(503)
            .create();

        let result = fetcher().fetch(&format!("{}/busy", server.url()), &[503]);
        assert!(matches!(result, Err(FetchError::RetriableStatus(503))));
    }

    #[test]
    fn error_status_outside_retry_set_is_returned() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/gone").with_status(404).create();

        let response = fetcher()
            .fetch(&format!("{}/gone", server.url()), &[503])
            .unwrap();
        assert_eq!(response.status, 404);
    }

    #[test]
    fn latin1_body_is_converted() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/latin")
            .with_status(200)
            .with_header("Content-Type", "text/html; charset=ISO-8859-1")
            .with_body(vec![0x68, 0xE9, 0x68]) // "héh" in latin-1
            .create();

        let response = fetcher()
            .fetch(&format!("{}/latin", server.url()), &[])
            .unwrap();
        assert_eq!(response.body, "héh");
    }

    #[test]
    fn invalid_utf8_is_repaired() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/broken")
            .with_status(200)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body(vec![0x68, 0xFF, 0x68])
            .create();

        let response = fetcher()
            .fetch(&format!("{}/broken", server.url()), &[])
            .unwrap();
        assert_eq!(response.body, "h\u{FFFD}h");
    }

    #[test]
    fn unsupported_options_warn_but_build() {
        let mut config = NetworkConfig::default();
        config.tcp_fast_open = true;
        config.dns_doh = "https://dns.example/doh".to_string();
        let (_, warnings) = Fetcher::new(config).unwrap();
        assert!(warnings.iter().any(|w| w.contains("tcp.fastopen")));
        assert!(warnings.iter().any(|w| w.contains("dns.doh")));
    }
}
