//! Crawler configuration, read once per worker start from the stored
//! configuration body.

use crate::models::ConfigEntry;
use crate::utils::config_reader::ConfigReader;

/// One configured web archive.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub name: String,
    pub memento_prefix: String,
    pub timemap_prefix: String,
}

/// A `${var}` counter expanding custom URLs over an arithmetic sequence.
#[derive(Debug, Clone)]
pub struct Counter {
    pub variable: String,
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub archives: bool,
    pub archive_list: Vec<ArchiveConfig>,
    pub lock_ttl: u64,
    pub params_blacklist: Vec<String>,
    pub params_whitelist: Vec<String>,
    pub queries_blacklist_content: Vec<u64>,
    pub queries_blacklist_types: Vec<u64>,
    pub queries_blacklist_urls: Vec<u64>,
    pub queries_links: Vec<u64>,
    pub queries_whitelist_content: Vec<u64>,
    pub queries_whitelist_types: Vec<u64>,
    pub queries_whitelist_urls: Vec<u64>,
    pub recrawl: bool,
    pub recrawl_start: bool,
    pub retries: i64,
    pub retry_archive: bool,
    pub retry_http: Vec<u64>,
    pub sleep_error: u64,
    pub sleep_http: u64,
    pub sleep_idle: u64,
    pub sleep_db: u64,
    pub start_page: String,
    pub timing: bool,
    pub xml: bool,
    pub warn_files: bool,
    pub custom_counters: Vec<Counter>,
    pub custom_counters_global: bool,
    pub custom_recrawl: bool,
    pub custom_urls: Vec<String>,
}

impl CrawlerConfig {
    /// Read the `crawler` and `custom` categories. Warnings cover unknown
    /// keys, type mismatches, incomplete archives and sign-mismatched
    /// counters.
    pub fn from_entries(entries: &[ConfigEntry]) -> (Self, Vec<String>) {
        let mut reader = ConfigReader::new(entries);

        let archive_names = reader.strings_default("crawler", "archives.names", &["archives.org"]);
        let archive_memento = reader.strings_default(
            "crawler",
            "archives.urls.memento",
            &["http://web.archive.org/web/"],
        );
        let archive_timemap = reader.strings_default(
            "crawler",
            "archives.urls.timemap",
            &["http://web.archive.org/web/timemap/link/"],
        );

        let counter_vars = reader.strings("custom", "counters");
        let counter_start = reader.i64s("custom", "counters.start");
        let counter_end = reader.i64s("custom", "counters.end");
        let counter_step = reader.i64s("custom", "counters.step");

        let mut config = CrawlerConfig {
            archives: reader.bool("crawler", "archives", false),
            archive_list: Vec::new(),
            lock_ttl: reader.u64("crawler", "lock", 300),
            params_blacklist: reader.strings("crawler", "params.blacklist"),
            params_whitelist: reader.strings("crawler", "params.whitelist"),
            queries_blacklist_content: reader.u64s("crawler", "queries.blacklist.content"),
            queries_blacklist_types: reader.u64s("crawler", "queries.blacklist.types"),
            queries_blacklist_urls: reader.u64s("crawler", "queries.blacklist.urls"),
            queries_links: reader.u64s("crawler", "queries.links"),
            queries_whitelist_content: reader.u64s("crawler", "queries.whitelist.content"),
            queries_whitelist_types: reader.u64s("crawler", "queries.whitelist.types"),
            queries_whitelist_urls: reader.u64s("crawler", "queries.whitelist.urls"),
            recrawl: reader.bool("crawler", "recrawl", false),
            recrawl_start: reader.bool("crawler", "recrawl.start", true),
            retries: reader.i64("crawler", "retries", -1),
            retry_archive: reader.bool("crawler", "retry.archive", true),
            retry_http: reader.u64s_default("crawler", "retry.http", &[502, 503, 504]),
            sleep_error: reader.u64("crawler", "sleep.error", 5000),
            sleep_http: reader.u64("crawler", "sleep.http", 0),
            sleep_idle: reader.u64("crawler", "sleep.idle", 5000),
            sleep_db: reader.u64("crawler", "sleep.mysql", 20),
            start_page: reader.string("crawler", "start", "/"),
            timing: reader.bool("crawler", "timing", false),
            xml: reader.bool("crawler", "xml", false),
            warn_files: reader.bool("crawler", "warnings.file", false),
            custom_counters: Vec::new(),
            custom_counters_global: reader.bool("custom", "counters.global", true),
            custom_recrawl: reader.bool("custom", "recrawl", true),
            custom_urls: reader.strings("custom", "urls"),
        };

        let mut warnings = reader.take_warnings();

        // archives are complete only up to the shortest of the three arrays
        let complete = archive_names
            .len()
            .min(archive_memento.len())
            .min(archive_timemap.len());
        if archive_names.len() > complete
            || archive_memento.len() > complete
            || archive_timemap.len() > complete
        {
            warnings.push("incomplete archive entries ignored".to_string());
        }
        for i in 0..complete {
            config.archive_list.push(ArchiveConfig {
                name: archive_names[i].clone(),
                memento_prefix: archive_memento[i].clone(),
                timemap_prefix: archive_timemap[i].clone(),
            });
        }

        // counters whose step sign cannot reach the end are dropped
        for (i, variable) in counter_vars.iter().enumerate() {
            let start = counter_start.get(i).copied().unwrap_or(0);
            let end = counter_end.get(i).copied().unwrap_or(0);
            let step = counter_step.get(i).copied().unwrap_or(1);
            if step == 0 || (start < end && step < 0) || (start > end && step > 0) {
                warnings.push(format!(
                    "counter '{variable}' dropped: step {step} cannot reach {end} from {start}"
                ));
                continue;
            }
            config.custom_counters.push(Counter {
                variable: variable.clone(),
                start,
                end,
                step,
            });
        }

        if !config.params_blacklist.is_empty() && !config.params_whitelist.is_empty() {
            warnings.push(
                "params.blacklist and params.whitelist are mutually exclusive; using the blacklist"
                    .to_string(),
            );
            config.params_whitelist.clear();
        }

        (config, warnings)
    }
}

impl Counter {
    /// The arithmetic sequence `[start..end]` by `step`.
    pub fn values(&self) -> Vec<i64> {
        let mut values = Vec::new();
        let mut current = self.start;
        loop {
            values.push(current);
            if self.start == self.end {
                break;
            }
            current += self.step;
            if (self.start < self.end && current > self.end)
                || (self.start > self.end && current < self.end)
            {
                break;
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(json: &str) -> Vec<ConfigEntry> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults() {
        let (config, warnings) = CrawlerConfig::from_entries(&[]);
        assert_eq!(config.retries, -1);
        assert_eq!(config.retry_http, vec![502, 503, 504]);
        assert_eq!(config.start_page, "/");
        assert_eq!(config.archive_list.len(), 1);
        assert_eq!(config.archive_list[0].name, "archives.org");
        assert!(warnings.is_empty());
    }

    #[test]
    fn counter_sign_mismatch_dropped_with_warning() {
        let (config, warnings) = CrawlerConfig::from_entries(&entries(
            r#"[
                {"cat":"custom","name":"counters","value":["${n}","${m}"]},
                {"cat":"custom","name":"counters.start","value":[1,9]},
                {"cat":"custom","name":"counters.end","value":[3,1]},
                {"cat":"custom","name":"counters.step","value":[1,1]}
            ]"#,
        ));
        assert_eq!(config.custom_counters.len(), 1);
        assert_eq!(config.custom_counters[0].variable, "${n}");
        assert!(warnings.iter().any(|w| w.contains("${m}")));
    }

    #[test]
    fn counter_sequences() {
        let counter = Counter {
            variable: "${n}".to_string(),
            start: 1,
            end: 5,
            step: 2,
        };
        assert_eq!(counter.values(), vec![1, 3, 5]);

        let down = Counter {
            variable: "${n}".to_string(),
            start: 3,
            end: 1,
            step: -1,
        };
        assert_eq!(down.values(), vec![3, 2, 1]);

        let single = Counter {
            variable: "${n}".to_string(),
            start: 4,
            end: 4,
            step: 1,
        };
        assert_eq!(single.values(), vec![4]);
    }

    #[test]
    fn incomplete_archives_trimmed() {
        let (config, warnings) = CrawlerConfig::from_entries(&entries(
            r#"[
                {"cat":"crawler","name":"archives.names","value":["a","b"]},
                {"cat":"crawler","name":"archives.urls.memento","value":["http://a/m/"]},
                {"cat":"crawler","name":"archives.urls.timemap","value":["http://a/t/"]}
            ]"#,
        ));
        assert_eq!(config.archive_list.len(), 1);
        assert!(warnings.iter().any(|w| w.contains("incomplete archive")));
    }

    #[test]
    fn exclusive_param_filters() {
        let (config, warnings) = CrawlerConfig::from_entries(&entries(
            r#"[
                {"cat":"crawler","name":"params.blacklist","value":["session"]},
                {"cat":"crawler","name":"params.whitelist","value":["page"]}
            ]"#,
        ));
        assert_eq!(config.params_blacklist, vec!["session"]);
        assert!(config.params_whitelist.is_empty());
        assert_eq!(warnings.len(), 1);
    }
}
