//! Network configuration for a worker's HTTP client.
//!
//! Every option of the `network` category is recognised; options the HTTP
//! library cannot express are collected as warnings when the client is
//! built, never as errors.

use crate::models::ConfigEntry;
use crate::utils::config_reader::ConfigReader;

/// HTTP version selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    #[default]
    Any,
    V10,
    V11,
    V2,
    V2PriorKnowledge,
    V2Tls,
}

impl HttpVersion {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "any" => Some(HttpVersion::Any),
            "1.0" => Some(HttpVersion::V10),
            "1.1" => Some(HttpVersion::V11),
            "2" => Some(HttpVersion::V2),
            "2-PK" => Some(HttpVersion::V2PriorKnowledge),
            "2-TLS" => Some(HttpVersion::V2Tls),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub connections_max: u64,
    pub content_length_ignore: bool,
    pub cookies: bool,
    pub cookies_load: String,
    pub cookies_overwrite: bool,
    pub cookies_save: String,
    pub cookies_session: bool,
    pub cookies_set: String,
    pub dns_cache_timeout: i64,
    pub dns_doh: String,
    pub dns_interface: String,
    pub dns_resolves: Vec<String>,
    pub dns_servers: Vec<String>,
    pub dns_shuffle: bool,
    pub encoding_br: bool,
    pub encoding_deflate: bool,
    pub encoding_gzip: bool,
    pub encoding_identity: bool,
    pub encoding_transfer: bool,
    pub headers: Vec<String>,
    pub http_version: HttpVersion,
    pub local_interface: String,
    pub local_port: u64,
    pub local_port_range: u64,
    pub proxy: String,
    pub proxy_auth: String,
    pub proxy_headers: Vec<String>,
    pub proxy_pre: String,
    pub proxy_tls_srp_user: String,
    pub proxy_tls_srp_password: String,
    pub proxy_tunnelling: bool,
    pub redirect: bool,
    pub redirect_max: i64,
    pub redirect_post301: bool,
    pub redirect_post302: bool,
    pub redirect_post303: bool,
    pub referer: String,
    pub referer_automatic: bool,
    pub speed_down_limit: u64,
    pub speed_low_limit: u64,
    pub speed_low_time: u64,
    pub speed_up_limit: u64,
    pub ssl_verify_host: bool,
    pub ssl_verify_peer: bool,
    pub ssl_verify_proxy_host: bool,
    pub ssl_verify_proxy_peer: bool,
    pub ssl_verify_status: bool,
    pub tcp_fast_open: bool,
    pub tcp_keep_alive: bool,
    pub tcp_keep_alive_idle: u64,
    pub tcp_keep_alive_interval: u64,
    pub tcp_nagle: bool,
    pub connect_timeout: u64,
    pub happy_eyeballs_timeout: u64,
    pub request_timeout: u64,
    pub tls_srp_user: String,
    pub tls_srp_password: String,
    pub user_agent: String,
    pub verbose: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connections_max: 5,
            content_length_ignore: false,
            cookies: false,
            cookies_load: String::new(),
            cookies_overwrite: false,
            cookies_save: String::new(),
            cookies_session: true,
            cookies_set: String::new(),
            dns_cache_timeout: 60,
            dns_doh: String::new(),
            dns_interface: String::new(),
            dns_resolves: Vec::new(),
            dns_servers: Vec::new(),
            dns_shuffle: false,
            encoding_br: true,
            encoding_deflate: false,
            encoding_gzip: true,
            encoding_identity: true,
            encoding_transfer: false,
            headers: Vec::new(),
            http_version: HttpVersion::Any,
            local_interface: String::new(),
            local_port: 0,
            local_port_range: 1,
            proxy: String::new(),
            proxy_auth: String::new(),
            proxy_headers: Vec::new(),
            proxy_pre: String::new(),
            proxy_tls_srp_user: String::new(),
            proxy_tls_srp_password: String::new(),
            proxy_tunnelling: false,
            redirect: true,
            redirect_max: 20,
            redirect_post301: false,
            redirect_post302: false,
            redirect_post303: false,
            referer: String::new(),
            referer_automatic: false,
            speed_down_limit: 0,
            speed_low_limit: 0,
            speed_low_time: 0,
            speed_up_limit: 0,
            ssl_verify_host: true,
            ssl_verify_peer: true,
            ssl_verify_proxy_host: true,
            ssl_verify_proxy_peer: true,
            ssl_verify_status: false,
            tcp_fast_open: false,
            tcp_keep_alive: false,
            tcp_keep_alive_idle: 60,
            tcp_keep_alive_interval: 60,
            tcp_nagle: false,
            connect_timeout: 300,
            happy_eyeballs_timeout: 0,
            request_timeout: 300,
            tls_srp_user: String::new(),
            tls_srp_password: String::new(),
            user_agent: String::new(),
            verbose: false,
        }
    }
}

impl NetworkConfig {
    /// Read the `network` category from a configuration body.
    pub fn from_entries(entries: &[ConfigEntry]) -> (Self, Vec<String>) {
        let mut reader = ConfigReader::new(entries);
        let defaults = NetworkConfig::default();

        let http_version_raw = reader.string("network", "http.version", "any");
        let http_version = HttpVersion::parse(&http_version_raw);

        let config = NetworkConfig {
            connections_max: reader.u64("network", "connections.max", defaults.connections_max),
            content_length_ignore: reader.bool("network", "contentlength.ignore", false),
            cookies: reader.bool("network", "cookies", false),
            cookies_load: reader.string("network", "cookies.load", ""),
            cookies_overwrite: reader.bool("network", "cookies.overwrite", false),
            cookies_save: reader.string("network", "cookies.save", ""),
            cookies_session: reader.bool("network", "cookies.session", true),
            cookies_set: reader.string("network", "cookies.set", ""),
            dns_cache_timeout: reader.i64("network", "dns.cachetimeout", defaults.dns_cache_timeout),
            dns_doh: reader.string("network", "dns.doh", ""),
            dns_interface: reader.string("network", "dns.interface", ""),
            dns_resolves: reader.strings("network", "dns.resolves"),
            dns_servers: reader.strings("network", "dns.servers"),
            dns_shuffle: reader.bool("network", "dns.shuffle", false),
            encoding_br: reader.bool("network", "encoding.br", true),
            encoding_deflate: reader.bool("network", "encoding.deflate", false),
            encoding_gzip: reader.bool("network", "encoding.gzip", true),
            encoding_identity: reader.bool("network", "encoding.identity", true),
            encoding_transfer: reader.bool("network", "encoding.transfer", false),
            headers: reader.strings("network", "headers"),
            http_version: http_version.unwrap_or_default(),
            local_interface: reader.string("network", "local.interface", ""),
            local_port: reader.u64("network", "local.port", 0),
            local_port_range: reader.u64("network", "local.portrange", 1),
            proxy: reader.string("network", "proxy", ""),
            proxy_auth: reader.string("network", "proxy.auth", ""),
            proxy_headers: reader.strings("network", "proxy.headers"),
            proxy_pre: reader.string("network", "proxy.pre", ""),
            proxy_tls_srp_user: reader.string("network", "proxy.tlssrp.user", ""),
            proxy_tls_srp_password: reader.string("network", "proxy.tlssrp.password", ""),
            // historical double-y spelling accepted alongside the obvious one
            proxy_tunnelling: reader.bool_alias(
                "network",
                &["proxyy.tunnelling", "proxy.tunnelling"],
                false,
            ),
            redirect: reader.bool("network", "redirect", true),
            redirect_max: reader.i64("network", "redirect.max", defaults.redirect_max),
            redirect_post301: reader.bool("network", "redirect.post301", false),
            redirect_post302: reader.bool("network", "redirect.post302", false),
            redirect_post303: reader.bool("network", "redirect.post303", false),
            referer: reader.string("network", "referer", ""),
            referer_automatic: reader.bool("network", "referer.automatic", false),
            speed_down_limit: reader.u64("network", "speed.downlimit", 0),
            speed_low_limit: reader.u64("network", "speed.lowlimit", 0),
            speed_low_time: reader.u64("network", "speed.lowtime", 0),
            speed_up_limit: reader.u64("network", "speed.uplimit", 0),
            ssl_verify_host: reader.bool("network", "ssl.verify.host", true),
            ssl_verify_peer: reader.bool("network", "ssl.verify.peer", true),
            ssl_verify_proxy_host: reader.bool("network", "ssl.verify.proxy.host", true),
            ssl_verify_proxy_peer: reader.bool("network", "ssl.verify.proxy.peer", true),
            ssl_verify_status: reader.bool("network", "ssl.verify.status", false),
            tcp_fast_open: reader.bool("network", "tcp.fastopen", false),
            tcp_keep_alive: reader.bool("network", "tcp.keepalive", false),
            tcp_keep_alive_idle: reader.u64("network", "tcp.keepalive.idle", 60),
            tcp_keep_alive_interval: reader.u64("network", "tcp.keepalive.interval", 60),
            tcp_nagle: reader.bool("network", "tcp.nagle", false),
            connect_timeout: reader.u64("network", "timeout", defaults.connect_timeout),
            happy_eyeballs_timeout: reader.u64("network", "timeout.happyeyeballs", 0),
            request_timeout: reader.u64("network", "timeout.request", defaults.request_timeout),
            tls_srp_user: reader.string("network", "tlssrp.user", ""),
            tls_srp_password: reader.string("network", "tlssrp.password", ""),
            user_agent: reader.string("network", "useragent", ""),
            verbose: reader.bool("network", "verbose", false),
        };

        let mut warnings = reader.take_warnings();
        if http_version.is_none() {
            warnings.push(format!("unknown HTTP version '{http_version_raw}'"));
        }

        (config, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(json: &str) -> Vec<ConfigEntry> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults_without_entries() {
        let (config, warnings) = NetworkConfig::from_entries(&[]);
        assert!(config.redirect);
        assert_eq!(config.request_timeout, 300);
        assert!(warnings.is_empty());
    }

    #[test]
    fn proxy_tunnelling_alias() {
        let (config, _) = NetworkConfig::from_entries(&entries(
            r#"[{"cat":"network","name":"proxyy.tunnelling","value":true}]"#,
        ));
        assert!(config.proxy_tunnelling);

        let (config, _) = NetworkConfig::from_entries(&entries(
            r#"[{"cat":"network","name":"proxy.tunnelling","value":true}]"#,
        ));
        assert!(config.proxy_tunnelling);
    }

    #[test]
    fn unknown_http_version_warns() {
        let (config, warnings) = NetworkConfig::from_entries(&entries(
            r#"[{"cat":"network","name":"http.version","value":"3"}]"#,
        ));
        assert_eq!(config.http_version, HttpVersion::Any);
        assert!(warnings.iter().any(|w| w.contains("HTTP version")));
    }
}
