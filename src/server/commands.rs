//! Command handlers of the control endpoint.
//!
//! Every command receives the parsed JSON body and returns a
//! [`CmdResponse`]; handler errors are caught by the dispatcher and turned
//! into a `fail` response carrying the request body for debugging.
//! Destructive commands require a second request with `"confirmed": true`.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::models::{ModuleKind, QueryKind, QueryProperties, ThreadOptions};
use crate::queries::CompiledQuery;
use crate::utils::datetime::ms_to_string;
use crate::utils::urls::is_valid_namespace;
use crate::workers::supervisor::Supervisor;

pub type SharedSupervisor = Arc<Mutex<Supervisor>>;

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Serialize, Debug, Default)]
pub struct CmdResponse {
    #[serde(skip_serializing_if = "is_false")]
    pub fail: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub confirm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl CmdResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn ok_with_id(id: u64, text: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn fail(text: impl Into<String>) -> Self {
        Self {
            fail: true,
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn confirm(text: impl Into<String>) -> Self {
        Self {
            confirm: true,
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Outcome of dispatching one command.
pub enum Handled {
    Done(CmdResponse),
    /// The command runs on a worker thread; the response arrives later.
    Async(tokio::sync::oneshot::Receiver<CmdResponse>),
}

fn arg_str<'a>(json: &'a Value, name: &str) -> Result<&'a str, CmdResponse> {
    match json.get(name) {
        None => Err(CmdResponse::fail(format!(
            "Invalid arguments ('{name}' is missing)."
        ))),
        Some(value) => value.as_str().ok_or_else(|| {
            CmdResponse::fail(format!("Invalid arguments ('{name}' is not a string)."))
        }),
    }
}

fn arg_u64(json: &Value, name: &str) -> Result<u64, CmdResponse> {
    match json.get(name) {
        None => Err(CmdResponse::fail(format!(
            "Invalid arguments ('{name}' is missing)."
        ))),
        Some(value) => value.as_u64().ok_or_else(|| {
            CmdResponse::fail(format!("Invalid arguments ('{name}' is not a number)."))
        }),
    }
}

fn arg_bool(json: &Value, name: &str) -> Result<bool, CmdResponse> {
    match json.get(name) {
        None => Err(CmdResponse::fail(format!(
            "Invalid arguments ('{name}' is missing)."
        ))),
        Some(value) => value.as_bool().ok_or_else(|| {
            CmdResponse::fail(format!("Invalid arguments ('{name}' is not a boolean)."))
        }),
    }
}

fn confirmed(json: &Value) -> bool {
    json.get("confirmed").and_then(Value::as_bool).unwrap_or(false)
}

/// Parse and dispatch one request body. Panics and repository errors become
/// `fail` responses carrying the body.
pub fn handle(supervisor: &SharedSupervisor, ip: &str, body: &str) -> Handled {
    let json: Value = match serde_json::from_str(body) {
        Ok(json) => json,
        Err(_) => {
            return Handled::Done(CmdResponse {
                fail: true,
                text: "Could not parse JSON.".to_string(),
                debug: Some(body.to_string()),
                ..Default::default()
            })
        }
    };
    let Some(command) = json.get("cmd").and_then(Value::as_str) else {
        return Handled::Done(CmdResponse {
            fail: true,
            text: "No command specified.".to_string(),
            debug: Some(body.to_string()),
            ..Default::default()
        });
    };
    let command = command.to_string();

    if command == "testquery" {
        return test_query(supervisor, &json);
    }

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        dispatch(supervisor, ip, &command, &json)
    }));
    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => CmdResponse {
            fail: true,
            text: error.to_string(),
            debug: Some(body.to_string()),
            ..Default::default()
        },
        Err(_) => CmdResponse {
            fail: true,
            text: format!("Command '{command}' failed."),
            debug: Some(body.to_string()),
            ..Default::default()
        },
    };
    Handled::Done(response)
}

fn dispatch(
    supervisor: &SharedSupervisor,
    ip: &str,
    command: &str,
    json: &Value,
) -> Result<CmdResponse, crate::repository::RepositoryError> {
    let mut sup = match supervisor.lock() {
        Ok(sup) => sup,
        Err(poisoned) => poisoned.into_inner(),
    };

    let response = match command {
        "kill" => cmd_kill(&mut sup, json, ip)?,
        "allow" => cmd_allow(&mut sup, json, ip)?,
        "disallow" => cmd_disallow(&mut sup, ip)?,
        "log" => cmd_log(&mut sup, json)?,
        "clearlogs" => cmd_clear_logs(&mut sup, json, ip)?,

        "startcrawler" => cmd_start(&mut sup, json, ip, ModuleKind::Crawler)?,
        "pausecrawler" => cmd_pause(&mut sup, json, ip, ModuleKind::Crawler)?,
        "unpausecrawler" => cmd_unpause(&mut sup, json, ip, ModuleKind::Crawler)?,
        "stopcrawler" => cmd_stop(&mut sup, json, ip, ModuleKind::Crawler)?,

        "startparser" => cmd_start(&mut sup, json, ip, ModuleKind::Parser)?,
        "pauseparser" => cmd_pause(&mut sup, json, ip, ModuleKind::Parser)?,
        "unpauseparser" => cmd_unpause(&mut sup, json, ip, ModuleKind::Parser)?,
        "stopparser" => cmd_stop(&mut sup, json, ip, ModuleKind::Parser)?,

        "startextractor" => cmd_start(&mut sup, json, ip, ModuleKind::Extractor)?,
        "pauseextractor" => cmd_pause(&mut sup, json, ip, ModuleKind::Extractor)?,
        "unpauseextractor" => cmd_unpause(&mut sup, json, ip, ModuleKind::Extractor)?,
        "stopextractor" => cmd_stop(&mut sup, json, ip, ModuleKind::Extractor)?,

        "startanalyzer" => cmd_start(&mut sup, json, ip, ModuleKind::Analyzer)?,
        "pauseanalyzer" => cmd_pause(&mut sup, json, ip, ModuleKind::Analyzer)?,
        "unpauseanalyzer" => cmd_unpause(&mut sup, json, ip, ModuleKind::Analyzer)?,
        "stopanalyzer" => cmd_stop(&mut sup, json, ip, ModuleKind::Analyzer)?,

        "addwebsite" => cmd_add_website(&mut sup, json)?,
        "updatewebsite" => cmd_update_website(&mut sup, json)?,
        "deletewebsite" => cmd_delete_website(&mut sup, json, ip)?,
        "duplicatewebsite" => cmd_duplicate_website(&mut sup, json)?,

        "addurllist" => cmd_add_url_list(&mut sup, json)?,
        "updateurllist" => cmd_update_url_list(&mut sup, json)?,
        "deleteurllist" => cmd_delete_url_list(&mut sup, json, ip)?,

        "addquery" => cmd_add_query(&mut sup, json)?,
        "updatequery" => cmd_update_query(&mut sup, json)?,
        "deletequery" => cmd_delete_query(&mut sup, json)?,
        "duplicatequery" => cmd_duplicate_query(&mut sup, json)?,

        "addconfig" => cmd_add_config(&mut sup, json)?,
        "updateconfig" => cmd_update_config(&mut sup, json)?,
        "deleteconfig" => cmd_delete_config(&mut sup, json)?,
        "duplicateconfig" => cmd_duplicate_config(&mut sup, json)?,

        _ => CmdResponse::fail(format!("Unknown command '{command}'.")),
    };
    Ok(response)
}

type CmdResult = Result<CmdResponse, crate::repository::RepositoryError>;

fn cmd_kill(sup: &mut Supervisor, json: &Value, ip: &str) -> CmdResult {
    if !confirmed(json) {
        return Ok(CmdResponse::confirm("Are you sure to kill the server?"));
    }
    sup.kill();
    sup.store().log("server", &format!("Killed by {ip}."))?;
    Ok(CmdResponse::ok("Bye bye."))
}

fn cmd_allow(sup: &mut Supervisor, json: &Value, ip: &str) -> CmdResult {
    let to_allow = match arg_str(json, "ip") {
        Ok(value) => value.to_string(),
        Err(response) => return Ok(response),
    };
    if !confirmed(json) {
        return Ok(CmdResponse::confirm(format!(
            "Do you really want to allow {to_allow} access to the server?"
        )));
    }
    sup.allow_ip(&to_allow);
    sup.store()
        .log("server", &format!("{to_allow} allowed by {ip}."))?;
    Ok(CmdResponse::ok(format!(
        "Allowed IPs: {}.",
        sup.allowed_list()
    )))
}

fn cmd_disallow(sup: &mut Supervisor, ip: &str) -> CmdResult {
    sup.disallow_ips();
    sup.store()
        .log("server", &format!("Allowed IPs reset by {ip}."))?;
    Ok(CmdResponse::ok(format!(
        "Allowed IP(s): {}.",
        sup.allowed_list()
    )))
}

fn cmd_log(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let entry = match arg_str(json, "entry") {
        Ok(value) => value.to_string(),
        Err(response) => return Ok(response),
    };
    sup.store().log("frontend", &entry)?;
    Ok(CmdResponse::ok(format!("Wrote log entry: {entry}")))
}

fn cmd_clear_logs(sup: &mut Supervisor, json: &Value, ip: &str) -> CmdResult {
    if !sup.settings().logs_deletable {
        return Ok(CmdResponse::fail("Not allowed."));
    }
    let module = json
        .get("module")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if !confirmed(json) {
        let count = sup.store().count_log_entries(&module)?;
        return Ok(CmdResponse::confirm(format!(
            "Are you sure to delete {count} log entries?"
        )));
    }
    sup.store().clear_logs(&module)?;
    if module.is_empty() {
        sup.store()
            .log("server", &format!("All logs cleared by {ip}."))?;
        Ok(CmdResponse::ok("All logs cleared."))
    } else {
        sup.store()
            .log("server", &format!("Logs of {module} cleared by {ip}."))?;
        Ok(CmdResponse::ok(format!("Logs of {module} cleared.")))
    }
}

fn thread_options(sup: &mut Supervisor, json: &Value) -> Result<ThreadOptions, CmdResponse> {
    let options = ThreadOptions {
        website: arg_u64(json, "website")?,
        url_list: arg_u64(json, "urllist")?,
        config: arg_u64(json, "config")?,
    };
    if !sup.store().is_website(options.website).unwrap_or(false) {
        return Err(CmdResponse::fail(format!(
            "Website #{} not found.",
            options.website
        )));
    }
    if !sup
        .store()
        .is_url_list(options.website, options.url_list)
        .unwrap_or(false)
    {
        return Err(CmdResponse::fail(format!(
            "URL list #{} for website #{} not found.",
            options.url_list, options.website
        )));
    }
    if !sup
        .store()
        .is_configuration(options.website, options.config)
        .unwrap_or(false)
    {
        return Err(CmdResponse::fail(format!(
            "Configuration #{} for website #{} not found.",
            options.config, options.website
        )));
    }
    Ok(options)
}

fn cmd_start(sup: &mut Supervisor, json: &Value, ip: &str, module: ModuleKind) -> CmdResult {
    let options = match thread_options(sup, json) {
        Ok(options) => options,
        Err(response) => return Ok(response),
    };
    let id = sup.start_worker(module, options)?;
    sup.store()
        .log(module.as_str(), &format!("[#{id}] started by {ip}."))?;
    Ok(CmdResponse::ok_with_id(
        id,
        format!("{} has been started.", capitalised(module)),
    ))
}

fn cmd_pause(sup: &mut Supervisor, json: &Value, ip: &str, module: ModuleKind) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    match sup.pause_worker(module, id)? {
        None => Ok(CmdResponse::fail(format!(
            "Could not find {module} #{id}."
        ))),
        Some(false) => Ok(CmdResponse::fail(format!(
            "{} #{id} cannot be paused at the moment.",
            capitalised(module)
        ))),
        Some(true) => {
            sup.store()
                .log(module.as_str(), &format!("[#{id}] paused by {ip}."))?;
            Ok(CmdResponse::ok(format!("{} is pausing.", capitalised(module))))
        }
    }
}

fn cmd_unpause(sup: &mut Supervisor, json: &Value, ip: &str, module: ModuleKind) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    match sup.unpause_worker(module, id)? {
        None => Ok(CmdResponse::fail(format!(
            "Could not find {module} #{id}."
        ))),
        Some(_) => {
            sup.store()
                .log(module.as_str(), &format!("[#{id}] unpaused by {ip}."))?;
            Ok(CmdResponse::ok(format!(
                "{} is unpausing.",
                capitalised(module)
            )))
        }
    }
}

fn cmd_stop(sup: &mut Supervisor, json: &Value, ip: &str, module: ModuleKind) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    match sup.stop_worker(module, id)? {
        None => Ok(CmdResponse::fail(format!(
            "Could not find {module} #{id}."
        ))),
        Some(()) => {
            sup.store()
                .log(module.as_str(), &format!("[#{id}] stopped by {ip}."))?;
            Ok(CmdResponse::ok(format!("{} stopped.", capitalised(module))))
        }
    }
}

fn capitalised(module: ModuleKind) -> String {
    let name = module.as_str();
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        out.extend(first.to_uppercase());
    }
    out.push_str(chars.as_str());
    out
}

fn check_namespace(namespace: &str, what: &str) -> Option<CmdResponse> {
    if !is_valid_namespace(namespace) {
        return Some(CmdResponse::fail(format!(
            "Invalid character(s) in {what} namespace."
        )));
    }
    None
}

fn cmd_add_website(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let (name, namespace, domain) = match (
        arg_str(json, "name"),
        arg_str(json, "namespace"),
        arg_str(json, "domain"),
    ) {
        (Ok(n), Ok(ns), Ok(d)) => (n, ns, d),
        (Err(r), _, _) | (_, Err(r), _) | (_, _, Err(r)) => return Ok(r),
    };
    if let Some(response) = check_namespace(namespace, "website") {
        return Ok(response);
    }
    match sup.store().add_website(name, namespace, domain) {
        Ok(id) => Ok(CmdResponse::ok_with_id(id, "Website added.")),
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

fn cmd_update_website(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    let (name, namespace, domain) = match (
        arg_str(json, "name"),
        arg_str(json, "namespace"),
        arg_str(json, "domain"),
    ) {
        (Ok(n), Ok(ns), Ok(d)) => (n, ns, d),
        (Err(r), _, _) | (_, Err(r), _) | (_, _, Err(r)) => return Ok(r),
    };
    if let Some(response) = check_namespace(namespace, "website") {
        return Ok(response);
    }
    if let Some(module) = sup.website_busy(id) {
        return Ok(CmdResponse::fail(format!(
            "Website cannot be changed while {module} is active."
        )));
    }
    match sup.store().update_website(id, name, namespace, domain) {
        Ok(()) => Ok(CmdResponse::ok("Website updated.")),
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

fn cmd_delete_website(sup: &mut Supervisor, json: &Value, ip: &str) -> CmdResult {
    if !sup.settings().data_deletable {
        return Ok(CmdResponse::fail("Not allowed."));
    }
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    if let Some(module) = sup.website_busy(id) {
        return Ok(CmdResponse::fail(format!(
            "Website cannot be deleted while {module} is active."
        )));
    }
    if !confirmed(json) {
        return Ok(CmdResponse::confirm(
            "Are you sure to delete this website? ALL associated data will be lost.",
        ));
    }
    match sup.store().delete_website(id) {
        Ok(()) => {
            sup.store()
                .log("server", &format!("Website #{id} deleted by {ip}."))?;
            Ok(CmdResponse::ok("Website deleted."))
        }
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

fn cmd_duplicate_website(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    match sup.store().duplicate_website(id) {
        Ok(new_id) => Ok(CmdResponse::ok_with_id(new_id, "Website duplicated.")),
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

fn cmd_add_url_list(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let website = match arg_u64(json, "website") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    let (name, namespace) = match (arg_str(json, "name"), arg_str(json, "namespace")) {
        (Ok(n), Ok(ns)) => (n, ns),
        (Err(r), _) | (_, Err(r)) => return Ok(r),
    };
    if let Some(response) = check_namespace(namespace, "URL list") {
        return Ok(response);
    }
    match sup.store().add_url_list(website, name, namespace) {
        Ok(id) => Ok(CmdResponse::ok_with_id(id, "URL list added.")),
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

fn cmd_update_url_list(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    let (name, namespace) = match (arg_str(json, "name"), arg_str(json, "namespace")) {
        (Ok(n), Ok(ns)) => (n, ns),
        (Err(r), _) | (_, Err(r)) => return Ok(r),
    };
    if let Some(response) = check_namespace(namespace, "URL list") {
        return Ok(response);
    }
    if let Some(module) = sup.url_list_busy(id) {
        return Ok(CmdResponse::fail(format!(
            "URL list cannot be changed while {module} is active."
        )));
    }
    match sup.store().update_url_list(id, name, namespace) {
        Ok(()) => Ok(CmdResponse::ok("URL list updated.")),
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

fn cmd_delete_url_list(sup: &mut Supervisor, json: &Value, ip: &str) -> CmdResult {
    if !sup.settings().data_deletable {
        return Ok(CmdResponse::fail("Not allowed."));
    }
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    if let Some(module) = sup.url_list_busy(id) {
        return Ok(CmdResponse::fail(format!(
            "URL list cannot be deleted while {module} is active."
        )));
    }
    if !confirmed(json) {
        return Ok(CmdResponse::confirm(
            "Are you sure to delete this URL list? ALL associated data will be lost.",
        ));
    }
    match sup.store().delete_url_list(id) {
        Ok(()) => {
            sup.store()
                .log("server", &format!("URL list #{id} deleted by {ip}."))?;
            Ok(CmdResponse::ok("URL list deleted."))
        }
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

fn query_args(json: &Value) -> Result<(String, String, QueryKind, bool, bool, bool, bool), CmdResponse> {
    let name = arg_str(json, "name")?.to_string();
    let text = arg_str(json, "query")?.to_string();
    let kind_raw = arg_str(json, "type")?;
    let kind = QueryKind::parse(kind_raw)
        .ok_or_else(|| CmdResponse::fail(format!("Unknown query type: '{kind_raw}'.")))?;
    let result_bool = arg_bool(json, "resultbool")?;
    let result_single = arg_bool(json, "resultsingle")?;
    let result_multi = arg_bool(json, "resultmulti")?;
    let text_only = arg_bool(json, "textonly")?;
    if !result_bool && !result_single && !result_multi {
        return Err(CmdResponse::fail("No result type selected."));
    }
    Ok((
        name,
        text,
        kind,
        result_bool,
        result_single,
        result_multi,
        text_only,
    ))
}

fn cmd_add_query(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let website = match arg_u64(json, "website") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    let (name, text, kind, rb, rs, rm, to) = match query_args(json) {
        Ok(args) => args,
        Err(response) => return Ok(response),
    };
    let id = sup
        .store()
        .add_query(website, &name, &text, kind, rb, rs, rm, to)?;
    Ok(CmdResponse::ok_with_id(id, "Query added."))
}

fn cmd_update_query(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    let (name, text, kind, rb, rs, rm, to) = match query_args(json) {
        Ok(args) => args,
        Err(response) => return Ok(response),
    };
    sup.store()
        .update_query(id, &name, &text, kind, rb, rs, rm, to)?;
    Ok(CmdResponse::ok("Query updated."))
}

fn cmd_delete_query(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    if !confirmed(json) {
        return Ok(CmdResponse::confirm("Are you sure to delete this query?"));
    }
    sup.store().delete_query(id)?;
    Ok(CmdResponse::ok("Query deleted."))
}

fn cmd_duplicate_query(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    match sup.store().duplicate_query(id) {
        Ok(new_id) => Ok(CmdResponse::ok_with_id(new_id, "Query duplicated.")),
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

fn cmd_add_config(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let website = match arg_u64(json, "website") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    let (module, name, config) = match (
        arg_str(json, "module"),
        arg_str(json, "name"),
        arg_str(json, "config"),
    ) {
        (Ok(m), Ok(n), Ok(c)) => (m, n, c),
        (Err(r), _, _) | (_, Err(r), _) | (_, _, Err(r)) => return Ok(r),
    };
    match sup.store().add_configuration(website, module, name, config) {
        Ok(id) => Ok(CmdResponse::ok_with_id(id, "Configuration added.")),
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

fn cmd_update_config(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    let (name, config) = match (arg_str(json, "name"), arg_str(json, "config")) {
        (Ok(n), Ok(c)) => (n, c),
        (Err(r), _) | (_, Err(r)) => return Ok(r),
    };
    match sup.store().update_configuration(id, name, config) {
        Ok(()) => Ok(CmdResponse::ok("Configuration updated.")),
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

fn cmd_delete_config(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    if !confirmed(json) {
        return Ok(CmdResponse::confirm(
            "Are you sure to delete this configuration?",
        ));
    }
    sup.store().delete_configuration(id)?;
    Ok(CmdResponse::ok("Configuration deleted."))
}

fn cmd_duplicate_config(sup: &mut Supervisor, json: &Value) -> CmdResult {
    let id = match arg_u64(json, "id") {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    match sup.store().duplicate_configuration(id) {
        Ok(new_id) => Ok(CmdResponse::ok_with_id(new_id, "Configuration duplicated.")),
        Err(error) => Ok(CmdResponse::fail(error.to_string())),
    }
}

/// Compile and run a query against supplied text on a short-lived worker
/// thread, so a pathological query cannot block the endpoint.
fn test_query(supervisor: &SharedSupervisor, json: &Value) -> Handled {
    let args = (|| -> Result<(QueryProperties, String), CmdResponse> {
        let (name, text, kind, rb, rs, rm, to) = query_args(json)?;
        if text.is_empty() {
            return Err(CmdResponse::fail("Query text is empty."));
        }
        let subject = arg_str(json, "text")?.to_string();
        Ok((
            QueryProperties {
                id: 0,
                website: 0,
                name,
                text,
                kind,
                result_bool: rb,
                result_single: rs,
                result_multi: rm,
                text_only: to,
            },
            subject,
        ))
    })();
    let (props, subject) = match args {
        Ok(args) => args,
        Err(response) => return Handled::Done(response),
    };

    let (sender, receiver) = tokio::sync::oneshot::channel();
    let handle = std::thread::spawn(move || {
        let _ = sender.send(run_query_test(&props, &subject));
    });
    match supervisor.lock() {
        Ok(mut sup) => sup.adopt_query_test(handle),
        Err(poisoned) => poisoned.into_inner().adopt_query_test(handle),
    }
    Handled::Async(receiver)
}

fn run_query_test(props: &QueryProperties, subject: &str) -> CmdResponse {
    let compile_start = Instant::now();
    let query = match CompiledQuery::compile(props) {
        Ok(query) => query,
        Err(error) => return CmdResponse::fail(error.to_string()),
    };
    let mut result = format!(
        "COMPILING TIME: {}\n",
        ms_to_string(compile_start.elapsed().as_millis() as u64)
    );

    let document = (props.kind == QueryKind::XPath).then(|| scraper::Html::parse_document(subject));

    if props.result_bool {
        let step = Instant::now();
        let outcome = match &document {
            Some(doc) => query.select_bool(doc),
            None => query.match_bool(subject),
        };
        match outcome {
            Ok(found) => result.push_str(&format!(
                "BOOLEAN RESULT ({}): {found}\n",
                ms_to_string(step.elapsed().as_millis() as u64)
            )),
            Err(error) => return CmdResponse::fail(error.to_string()),
        }
    }
    if props.result_single {
        let step = Instant::now();
        let outcome = match &document {
            Some(doc) => query.select_first(doc),
            None => query.match_first(subject),
        };
        match outcome {
            Ok(found) => {
                let text = found.unwrap_or_else(|| "[empty]".to_string());
                result.push_str(&format!(
                    "FIRST RESULT ({}): {text}\n",
                    ms_to_string(step.elapsed().as_millis() as u64)
                ));
            }
            Err(error) => return CmdResponse::fail(error.to_string()),
        }
    }
    if props.result_multi {
        let step = Instant::now();
        let outcome = match &document {
            Some(doc) => query.select_all(doc),
            None => query.match_all(subject),
        };
        match outcome {
            Ok(found) => {
                result.push_str(&format!(
                    "ALL RESULTS ({}):",
                    ms_to_string(step.elapsed().as_millis() as u64)
                ));
                if found.is_empty() {
                    result.push_str(" [empty]\n");
                } else {
                    result.push('\n');
                    for (i, item) in found.iter().enumerate() {
                        result.push_str(&format!("[{}] {item}\n", i + 1));
                    }
                }
            }
            Err(error) => return CmdResponse::fail(error.to_string()),
        }
    }

    CmdResponse::ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_test_runs_regex() {
        let props = QueryProperties {
            id: 0,
            website: 0,
            name: "t".to_string(),
            text: r"\d+".to_string(),
            kind: QueryKind::Regex,
            result_bool: true,
            result_single: true,
            result_multi: true,
            text_only: false,
        };
        let response = run_query_test(&props, "a 12 b 34");
        assert!(!response.fail);
        assert!(response.text.contains("BOOLEAN RESULT"));
        assert!(response.text.contains("FIRST RESULT"));
        assert!(response.text.contains("[1] 12"));
        assert!(response.text.contains("[2] 34"));
    }

    #[test]
    fn query_test_reports_compile_errors() {
        let props = QueryProperties {
            id: 0,
            website: 0,
            name: "t".to_string(),
            text: "(broken".to_string(),
            kind: QueryKind::Regex,
            result_bool: true,
            result_single: false,
            result_multi: false,
            text_only: false,
        };
        assert!(run_query_test(&props, "x").fail);
    }

    #[test]
    fn response_serialisation_skips_empty_flags() {
        let ok = serde_json::to_value(CmdResponse::ok("done")).unwrap();
        assert_eq!(ok, serde_json::json!({"text": "done"}));

        let confirm = serde_json::to_value(CmdResponse::confirm("sure?")).unwrap();
        assert_eq!(confirm, serde_json::json!({"confirm": true, "text": "sure?"}));

        let with_id = serde_json::to_value(CmdResponse::ok_with_id(7, "added")).unwrap();
        assert_eq!(with_id, serde_json::json!({"id": 7, "text": "added"}));
    }
}
