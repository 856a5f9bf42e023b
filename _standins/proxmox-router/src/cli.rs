//! Command line interface runner: maps subcommand names to API
//! methods, parses arguments against their schemas, and invokes the
//! handlers.

use std::collections::{BTreeMap, HashMap, VecDeque};

use anyhow::{bail, Error};
use serde_json::Value;

use proxmox_schema::{
    parse_boolean, parse_parameter_strings, ApiStringFormat, EnumEntry, ObjectSchema, Schema,
    StringSchema,
};

use crate::{ApiHandler, ApiMethod, RpcEnvironment, RpcEnvironmentType};

/// Schema of the common `output-format` CLI option.
pub const OUTPUT_FORMAT: Schema = StringSchema::new("Output format.")
    .format(&ApiStringFormat::Enum(&[
        EnumEntry::new("text", "plain text output"),
        EnumEntry::new("json", "single line json formatted output"),
        EnumEntry::new("json-pretty", "pretty-printed json output"),
    ]))
    .schema();

/// The `output-format` requested in a parameter object, defaulting to
/// `text`.
pub fn get_output_format(param: &Value) -> String {
    match param["output-format"].as_str() {
        Some(format) => format.to_owned(),
        None => String::from("text"),
    }
}

/// Print a result value in the requested (json) output format.
pub fn format_and_print_result(result: &Value, output_format: &str) {
    if output_format == "json-pretty" {
        println!("{}", serde_json::to_string_pretty(&result).unwrap());
    } else if output_format == "json" {
        println!("{}", serde_json::to_string(&result).unwrap());
    } else {
        unimplemented!();
    }
}

/// Completion callback: current argument value and the parameters
/// already parsed, returning the completion candidates.
pub type CompletionFunction = fn(&str, &HashMap<String, String>) -> Vec<String>;

/// One CLI (sub)command bound to an API method.
pub struct CliCommand {
    pub info: &'static ApiMethod,
    pub arg_param: &'static [&'static str],
    pub completion_functions: HashMap<String, CompletionFunction>,
}

impl CliCommand {
    pub fn new(info: &'static ApiMethod) -> Self {
        Self {
            info,
            arg_param: &[],
            completion_functions: HashMap::new(),
        }
    }

    /// Positional parameters, mapped onto properties in order.
    pub fn arg_param(mut self, names: &'static [&'static str]) -> Self {
        self.arg_param = names;
        self
    }

    /// Register a completion callback for one parameter.
    pub fn completion_cb(mut self, param_name: &str, cb: CompletionFunction) -> Self {
        self.completion_functions.insert(param_name.into(), cb);
        self
    }
}

/// Map of named subcommands.
#[derive(Default)]
pub struct CliCommandMap {
    pub commands: BTreeMap<String, CommandLineInterface>,
}

impl CliCommandMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new named subcommand.
    pub fn insert<C: Into<CommandLineInterface>>(mut self, name: &str, cli: C) -> Self {
        self.commands.insert(name.into(), cli.into());
        self
    }

    /// Find a subcommand by exact name or unambiguous prefix.
    fn find_command(&self, name: &str) -> Option<(&str, &CommandLineInterface)> {
        if let Some((key, interface)) = self.commands.get_key_value(name) {
            return Some((key.as_str(), interface));
        }

        let mut matches = self
            .commands
            .iter()
            .filter(|(key, _)| key.starts_with(name));
        match (matches.next(), matches.next()) {
            (Some((key, interface)), None) => Some((key.as_str(), interface)),
            _ => None,
        }
    }
}

/// A whole command line interface: a single command or a nested map.
pub enum CommandLineInterface {
    Simple(CliCommand),
    Nested(CliCommandMap),
}

impl From<CliCommand> for CommandLineInterface {
    fn from(cli_cmd: CliCommand) -> Self {
        CommandLineInterface::Simple(cli_cmd)
    }
}

impl From<CliCommandMap> for CommandLineInterface {
    fn from(map: CliCommandMap) -> Self {
        CommandLineInterface::Nested(map)
    }
}

/// CLI RPC environment.
pub struct CliEnvironment {
    result_attributes: Value,
    auth_id: Option<String>,
}

impl Default for CliEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl CliEnvironment {
    pub fn new() -> Self {
        Self {
            result_attributes: Value::Object(serde_json::Map::new()),
            auth_id: None,
        }
    }
}

impl RpcEnvironment for CliEnvironment {
    fn result_attrib_mut(&mut self) -> &mut Value {
        &mut self.result_attributes
    }

    fn result_attrib(&self) -> &Value {
        &self.result_attributes
    }

    fn env_type(&self) -> RpcEnvironmentType {
        RpcEnvironmentType::Cli
    }

    fn set_auth_id(&mut self, auth_id: Option<String>) {
        self.auth_id = auth_id;
    }

    fn get_auth_id(&self) -> Option<String> {
        self.auth_id.clone()
    }
}

/// Runner for futures of asynchronous API handlers. Accepted for
/// signature compatibility; this stand-in only supports synchronous
/// handlers.
pub type CliFutureRunner = fn(
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, Error>> + Send>>,
) -> Result<Value, Error>;

/// Parse the process arguments against the command definition, run the
/// selected handler and exit non-zero on any failure.
pub fn run_cli_command<C: Into<CommandLineInterface>>(
    def: C,
    mut rpcenv: CliEnvironment,
    _run: Option<CliFutureRunner>,
) {
    let def = def.into();

    let mut args: VecDeque<String> = std::env::args().collect();
    let prefix = args
        .pop_front()
        .as_deref()
        .and_then(|arg0| arg0.rsplit('/').next().map(str::to_owned))
        .unwrap_or_else(|| String::from("command"));

    match args.front().map(String::as_str) {
        Some("bashcomplete") => {
            print_bash_completion(&def);
            return;
        }
        Some("help") => {
            args.pop_front();
            print_help(&def, &prefix, args.into_iter().collect());
            return;
        }
        _ => {}
    }

    if handle_command(&def, &prefix, args.into_iter().collect(), &mut rpcenv).is_err() {
        std::process::exit(-1);
    }
}

fn handle_command(
    def: &CommandLineInterface,
    prefix: &str,
    args: Vec<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), ()> {
    match def {
        CommandLineInterface::Simple(cli_cmd) => {
            handle_simple_command(prefix, cli_cmd, args, rpcenv)
        }
        CommandLineInterface::Nested(map) => handle_nested_command(prefix, map, args, rpcenv),
    }
}

fn handle_nested_command(
    prefix: &str,
    map: &CliCommandMap,
    mut args: Vec<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), ()> {
    if args.is_empty() {
        eprintln!("Error: no command specified.");
        eprint!("{}", generate_nested_usage(prefix, map));
        return Err(());
    }

    let name = args.remove(0);
    if name == "-h" || name == "--help" {
        print!("{}", generate_nested_usage(prefix, map));
        return Ok(());
    }

    match map.find_command(&name) {
        Some((full_name, sub_cmd)) => {
            let prefix = format!("{} {}", prefix, full_name);
            handle_command(sub_cmd, &prefix, args, rpcenv)
        }
        None => {
            eprintln!("Error: no such command '{}'", name);
            eprint!("{}", generate_nested_usage(prefix, map));
            Err(())
        }
    }
}

fn handle_simple_command(
    prefix: &str,
    cli_cmd: &CliCommand,
    args: Vec<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), ()> {
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print!("{}", generate_simple_usage(prefix, cli_cmd, true));
        return Ok(());
    }

    let (params, remaining) = match parse_arguments(&args, cli_cmd.arg_param, cli_cmd.info.parameters)
    {
        Ok(parsed) => parsed,
        Err(err) => return simple_usage_error(prefix, cli_cmd, &err.to_string()),
    };

    if !remaining.is_empty() {
        let msg = format!("too many arguments: '{}'", remaining.join(" "));
        return simple_usage_error(prefix, cli_cmd, &msg);
    }

    let params = match parse_parameter_strings(&params, cli_cmd.info.parameters, true) {
        Ok(params) => params,
        Err(err) => return simple_usage_error(prefix, cli_cmd, err.to_string().trim_end()),
    };

    let ApiHandler::Sync(handler) = cli_cmd.info.handler;
    match handler(params, cli_cmd.info, rpcenv) {
        Ok(value) => {
            if value != Value::Null {
                println!("Result: {}", serde_json::to_string_pretty(&value).unwrap());
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            Err(())
        }
    }
}

fn simple_usage_error(prefix: &str, cli_cmd: &CliCommand, msg: &str) -> Result<(), ()> {
    eprintln!("Error: {}", msg);
    eprint!("{}", generate_simple_usage(prefix, cli_cmd, false));
    Err(())
}

/// Split raw arguments into `(name, value)` option pairs and the
/// positional rest, consulting the schema for boolean options that may
/// appear without a value.
fn parse_argument_list(
    args: &[String],
    schema: &ObjectSchema,
) -> Result<(Vec<(String, String)>, Vec<String>), Error> {
    let mut params = Vec::new();
    let mut rest = Vec::new();

    let mut args: VecDeque<&String> = args.iter().collect();
    while let Some(arg) = args.pop_front() {
        if arg == "--" {
            rest.extend(args.drain(..).cloned());
            break;
        }

        let option = match arg.strip_prefix("--") {
            Some(option) if !option.is_empty() => option,
            _ => {
                rest.push(arg.clone());
                continue;
            }
        };

        if let Some(position) = option.find('=') {
            params.push((option[..position].to_owned(), option[position + 1..].to_owned()));
            continue;
        }

        let prop_schema = match schema.lookup(option) {
            Some((_optional, prop_schema)) => Some(prop_schema),
            None if schema.additional_properties => None,
            None => bail!("unknown option '--{}'", option),
        };

        if let Some(Schema::Boolean(_)) = prop_schema {
            // a following boolean value is consumed; anything else
            // means the flag is set
            match args.front() {
                Some(next) if parse_boolean(next).is_ok() => {
                    params.push((option.to_owned(), args.pop_front().unwrap().clone()));
                }
                _ => params.push((option.to_owned(), String::from("true"))),
            }
        } else {
            match args.pop_front() {
                Some(value) => params.push((option.to_owned(), value.clone())),
                None => bail!("missing parameter value for '--{}'", option),
            }
        }
    }

    Ok((params, rest))
}

/// Parse options and map positional arguments onto `arg_param` in
/// order; returns the parameter string pairs and any unassigned
/// positional arguments.
fn parse_arguments(
    args: &[String],
    arg_param: &[&str],
    schema: &ObjectSchema,
) -> Result<(Vec<(String, String)>, Vec<String>), Error> {
    let (mut params, positional) = parse_argument_list(args, schema)?;

    let mut positional = VecDeque::from(positional);
    for name in arg_param {
        let optional = match schema.lookup(name) {
            Some((optional, _schema)) => optional,
            None => bail!("fixed argument '{}' does not exist in the schema", name),
        };
        match positional.pop_front() {
            Some(value) => params.push((name.to_string(), value)),
            None if optional => {}
            None => bail!("missing argument '{}'", name),
        }
    }

    Ok((params, positional.into()))
}

fn usage_line(prefix: &str, cli_cmd: &CliCommand) -> String {
    let schema = cli_cmd.info.parameters;
    let mut usage = format!("Usage: {}", prefix);
    for name in cli_cmd.arg_param {
        usage.push_str(&format!(" <{}>", name));
    }
    let has_options = schema
        .properties
        .iter()
        .any(|(name, _, _)| !cli_cmd.arg_param.contains(name));
    if has_options {
        usage.push_str(" [OPTIONS]");
    }
    usage
}

fn generate_simple_usage(prefix: &str, cli_cmd: &CliCommand, verbose: bool) -> String {
    let schema = cli_cmd.info.parameters;
    let mut text = format!("{}\n", usage_line(prefix, cli_cmd));
    if !verbose {
        return text;
    }

    text.push_str(&format!("\n{}\n", schema.description));
    for (name, optional, prop_schema) in schema.properties {
        let kind = if cli_cmd.arg_param.contains(name) {
            format!("<{}>", name)
        } else {
            format!("--{} {}", name, prop_schema.type_text())
        };
        let note = if *optional { " (optional)" } else { "" };
        text.push_str(&format!(
            "\n  {}{}\n      {}\n",
            kind,
            note,
            prop_schema.description()
        ));
    }
    text
}

fn generate_nested_usage(prefix: &str, map: &CliCommandMap) -> String {
    let mut text = String::from("Usage:\n\n");
    for (name, interface) in &map.commands {
        let prefix = format!("{} {}", prefix, name);
        match interface {
            CommandLineInterface::Simple(cli_cmd) => {
                let line = usage_line(&prefix, cli_cmd);
                text.push_str(&format!("{}\n", line.trim_start_matches("Usage: ")));
            }
            CommandLineInterface::Nested(map) => {
                for line in generate_nested_usage(&prefix, map).lines().skip(1) {
                    if !line.is_empty() {
                        text.push_str(&format!("{}\n", line));
                    }
                }
            }
        }
    }
    text
}

fn print_help(def: &CommandLineInterface, prefix: &str, args: Vec<String>) {
    match def {
        CommandLineInterface::Simple(cli_cmd) => {
            print!("{}", generate_simple_usage(prefix, cli_cmd, true));
        }
        CommandLineInterface::Nested(map) => match args.first() {
            Some(name) => match map.find_command(name) {
                Some((full_name, sub_cmd)) => {
                    let prefix = format!("{} {}", prefix, full_name);
                    print_help(sub_cmd, &prefix, args[1..].to_vec());
                }
                None => {
                    eprintln!("Error: no such command '{}'", name);
                    eprint!("{}", generate_nested_usage(prefix, map));
                }
            },
            None => print!("{}", generate_nested_usage(prefix, map)),
        },
    }
}

/// Complete a file or directory name argument.
pub fn complete_file_name(arg: &str, _param: &HashMap<String, String>) -> Vec<String> {
    let mut result = Vec::new();

    let mut dirname = std::path::PathBuf::from(arg);
    let is_dir = std::fs::metadata(&dirname)
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false);
    if !(is_dir && arg.ends_with('/')) {
        dirname.pop();
    }
    if dirname.as_os_str().is_empty() {
        dirname = std::path::PathBuf::from("./");
    }

    let entries = match std::fs::read_dir(&dirname) {
        Ok(entries) => entries,
        Err(_) => return result,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(text) = path.to_str() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                result.push(format!("{}/", text));
            } else {
                result.push(text.to_owned());
            }
        }
    }
    result
}

/// Completion candidates for a partially typed command line, driven by
/// the `COMP_LINE`/`COMP_POINT` environment the shell completion hook
/// provides.
fn print_bash_completion(def: &CommandLineInterface) {
    let comp_point: usize = match std::env::var("COMP_POINT") {
        Ok(point) => match point.parse() {
            Ok(point) => point,
            Err(_) => return,
        },
        Err(_) => return,
    };
    let cmdline = match std::env::var("COMP_LINE") {
        Ok(line) => line.get(..comp_point).map(str::to_owned).unwrap_or(line),
        Err(_) => return,
    };

    let mut words: Vec<String> = cmdline.split_whitespace().map(str::to_owned).collect();
    let partial = if cmdline.ends_with(char::is_whitespace) || words.is_empty() {
        String::new()
    } else {
        words.pop().unwrap()
    };
    if !words.is_empty() {
        // drop the program name
        words.remove(0);
    }

    for candidate in get_completions(def, &words, &partial) {
        println!("{}", candidate);
    }
}

fn get_completions(def: &CommandLineInterface, words: &[String], partial: &str) -> Vec<String> {
    match def {
        CommandLineInterface::Nested(map) => match words.first() {
            Some(name) => match map.find_command(name) {
                Some((_, sub_cmd)) => get_completions(sub_cmd, &words[1..], partial),
                None => Vec::new(),
            },
            None => map
                .commands
                .keys()
                .filter(|name| name.starts_with(partial))
                .cloned()
                .collect(),
        },
        CommandLineInterface::Simple(cli_cmd) => {
            get_simple_completions(cli_cmd, words, partial)
        }
    }
}

fn get_simple_completions(cli_cmd: &CliCommand, words: &[String], partial: &str) -> Vec<String> {
    let schema = cli_cmd.info.parameters;
    let done: HashMap<String, String> = HashMap::new();

    // value of the option typed right before the current word
    if let Some(option) = words.last().and_then(|word| word.strip_prefix("--")) {
        if let Some((_, prop_schema)) = schema.lookup(option) {
            if !matches!(prop_schema, Schema::Boolean(_)) {
                return complete_property_value(cli_cmd, schema, option, partial, &done);
            }
        }
    }

    if partial.starts_with('-') {
        return schema
            .properties
            .iter()
            .map(|(name, _, _)| format!("--{}", name))
            .filter(|name| name.starts_with(partial.trim_start_matches('-')) || name.starts_with(partial))
            .collect();
    }

    // otherwise complete the next positional argument
    let positional_index = words
        .iter()
        .filter(|word| !word.starts_with("--"))
        .count();
    if let Some(name) = cli_cmd.arg_param.get(positional_index) {
        return complete_property_value(cli_cmd, schema, name, partial, &done);
    }
    Vec::new()
}

fn complete_property_value(
    cli_cmd: &CliCommand,
    schema: &ObjectSchema,
    name: &str,
    partial: &str,
    done: &HashMap<String, String>,
) -> Vec<String> {
    if let Some(cb) = cli_cmd.completion_functions.get(name) {
        return cb(partial, done)
            .into_iter()
            .filter(|value| value.starts_with(partial))
            .collect();
    }
    if let Some((_, Schema::String(StringSchema {
        format: Some(ApiStringFormat::Enum(entries)),
        ..
    }))) = schema.lookup(name)
    {
        return entries
            .iter()
            .map(|entry| entry.value.to_string())
            .filter(|value| value.starts_with(partial))
            .collect();
    }
    Vec::new()
}

struct CliLogger {
    filter: log::LevelFilter,
}

impl log::Log for CliLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.filter
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{}", record.args());
        }
    }

    fn flush(&self) {}
}

/// Initialize a plain message-only logger on stderr, filtered by the
/// level named in `env_var_name` (falling back to `default_log_level`).
pub fn init_cli_logger(env_var_name: &str, default_log_level: &str) {
    let spec = std::env::var(env_var_name).unwrap_or_else(|_| default_log_level.to_string());
    let filter = match spec.to_lowercase().as_str() {
        "off" => log::LevelFilter::Off,
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    if log::set_boxed_logger(Box::new(CliLogger { filter })).is_ok() {
        log::set_max_level(filter);
    }
}
