//! Mock MCP server for integration testing.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and answers
//! `initialize`, `ping`, `tools/*`, `prompts/*` and `resources/*`.
//!
//! Usage:
//!   mock-mcp-server [OPTIONS]
//!
//! Options:
//!   --name NAME          Server name (default: mock-mcp-server)
//!   --version V          Version reported in initialize (default: 1.0.0)
//!   --tools A,B,...      Advertised tools (default: echo,add,slow,crash,fail)
//!   --prompts A,B,...    Advertised prompts (default: none)
//!   --resources U,...    Advertised resource URIs (default: none)
//!   --crash-on TOOL      Exit with code 1 when TOOL is called
//!   --exit-after-ms N    Exit N ms after startup
//!   --exit-code C        Exit code used by --exit-after-ms (default: 0)
//!   --stderr LINE        Write LINE to stderr at startup
//!   --malformed          Write a non-JSON line to stdout at startup
//!   --hang-ping          Never answer ping

#![allow(dead_code)]

use std::env;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

/// JSON-RPC message from the client. Notifications carry no id.
#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

/// Server configuration parsed from command line.
struct ServerConfig {
    name: String,
    version: String,
    tools: Vec<String>,
    prompts: Vec<String>,
    resources: Vec<String>,
    crash_on: Option<String>,
    exit_after_ms: Option<u64>,
    exit_code: i32,
    stderr: Vec<String>,
    malformed: bool,
    hang_ping: bool,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl ServerConfig {
    fn from_args() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut config = Self {
            name: "mock-mcp-server".to_string(),
            version: "1.0.0".to_string(),
            tools: split_list("echo,add,slow,crash,fail"),
            prompts: Vec::new(),
            resources: Vec::new(),
            crash_on: None,
            exit_after_ms: None,
            exit_code: 0,
            stderr: Vec::new(),
            malformed: false,
            hang_ping: false,
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned().unwrap_or_default();
            match args[i].as_str() {
                "--name" => config.name = value,
                "--version" => config.version = value,
                "--tools" => config.tools = split_list(&value),
                "--prompts" => config.prompts = split_list(&value),
                "--resources" => config.resources = split_list(&value),
                "--crash-on" => config.crash_on = Some(value),
                "--exit-after-ms" => config.exit_after_ms = value.parse().ok(),
                "--exit-code" => config.exit_code = value.parse().unwrap_or(0),
                "--stderr" => config.stderr.push(value),
                "--malformed" => {
                    config.malformed = true;
                    i += 1;
                    continue;
                }
                "--hang-ping" => {
                    config.hang_ping = true;
                    i += 1;
                    continue;
                }
                _ => {
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }

        config
    }
}

fn main() {
    let config = ServerConfig::from_args();
    let stdout = Arc::new(Mutex::new(std::io::stdout()));

    for line in &config.stderr {
        eprintln!("{}", line);
    }
    if config.malformed {
        write_line(&stdout, "this is not json-rpc");
    }
    if let Some(ms) = config.exit_after_ms {
        let code = config.exit_code;
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(ms));
            std::process::exit(code);
        });
    }

    let stdin = std::io::stdin();
    let reader = BufReader::new(stdin.lock());
    for line in reader.lines() {
        let Ok(line) = line else {
            return;
        };
        if line.trim().is_empty() {
            continue;
        }
        let message: IncomingMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(_) => continue,
        };
        // Notifications need no answer.
        let Some(id) = message.id.clone() else {
            continue;
        };
        if message.method == "ping" && config.hang_ping {
            continue;
        }

        let response = match handle_request(&message, &config) {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
        };
        write_line(&stdout, &response.to_string());
    }
}

fn write_line(stdout: &Mutex<std::io::Stdout>, line: &str) {
    let Ok(mut stdout) = stdout.lock() else {
        return;
    };
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

fn tool_definition(name: &str) -> Value {
    match name {
        "echo" => json!({
            "name": "echo",
            "description": "Echo back the input",
            "inputSchema": {
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            }
        }),
        "add" => json!({
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "a": { "type": "number" },
                    "b": { "type": "number" }
                },
                "required": ["a", "b"]
            }
        }),
        "slow" => json!({
            "name": "slow",
            "description": "A slow tool for testing timeouts",
            "inputSchema": {
                "type": "object",
                "properties": { "delay_ms": { "type": "number" } }
            }
        }),
        "crash" => json!({
            "name": "crash",
            "description": "Crashes the server (for testing)",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        "fail" => json!({
            "name": "fail",
            "description": "Always answers with a JSON-RPC error",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        other => json!({
            "name": other,
            "description": format!("Mock tool {}", other),
            "inputSchema": { "type": "object", "properties": {} }
        }),
    }
}

fn text(value: impl Into<String>) -> Value {
    json!({ "content": [ { "type": "text", "text": value.into() } ] })
}

fn handle_request(message: &IncomingMessage, config: &ServerConfig) -> Result<Value, Value> {
    let params = message.params.clone().unwrap_or(json!({}));
    match message.method.as_str() {
        "initialize" => {
            let mut capabilities = json!({ "tools": { "listChanged": false } });
            if !config.prompts.is_empty() {
                capabilities["prompts"] = json!({});
            }
            if !config.resources.is_empty() {
                capabilities["resources"] = json!({});
            }
            Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": capabilities,
                "serverInfo": { "name": config.name, "version": config.version }
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({
            "tools": config.tools.iter().map(|t| tool_definition(t)).collect::<Vec<_>>()
        })),
        "tools/call" => {
            let tool = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let args = params.get("arguments").cloned().unwrap_or(json!({}));

            if config.crash_on.as_deref() == Some(tool) {
                std::process::exit(1);
            }
            if !config.tools.iter().any(|t| t == tool) {
                return Ok(json!({
                    "content": [ { "type": "text", "text": format!("Unknown tool: {}", tool) } ],
                    "isError": true
                }));
            }

            match tool {
                "echo" => Ok(text(args.get("message").and_then(|v| v.as_str()).unwrap_or(""))),
                "add" => {
                    let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    Ok(text(format!("{}", a + b)))
                }
                "slow" => {
                    let delay = args.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(1000);
                    thread::sleep(Duration::from_millis(delay));
                    Ok(text(format!("Slept for {} ms", delay)))
                }
                "crash" => std::process::exit(1),
                "fail" => Err(json!({ "code": -32000, "message": "tool failed on purpose" })),
                other => Ok(text(format!("{}:{}", config.name, other))),
            }
        }
        "prompts/list" => Ok(json!({
            "prompts": config.prompts.iter().map(|p| json!({
                "name": p,
                "description": format!("Prompt {} from {}", p, config.name)
            })).collect::<Vec<_>>()
        })),
        "prompts/get" => {
            let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
            if !config.prompts.iter().any(|p| p == name) {
                return Err(json!({ "code": -32602, "message": format!("unknown prompt {}", name) }));
            }
            Ok(json!({
                "messages": [ {
                    "role": "user",
                    "content": { "type": "text", "text": format!("{}:{}", config.name, name) }
                } ]
            }))
        }
        "resources/list" => Ok(json!({
            "resources": config.resources.iter().map(|uri| json!({
                "uri": uri,
                "name": uri.rsplit('/').next().unwrap_or(uri),
                "mimeType": "text/plain"
            })).collect::<Vec<_>>()
        })),
        "resources/read" => {
            let uri = params.get("uri").and_then(|v| v.as_str()).unwrap_or("");
            if !config.resources.iter().any(|r| r == uri) {
                return Err(json!({ "code": -32602, "message": format!("unknown resource {}", uri) }));
            }
            Ok(json!({
                "contents": [ { "uri": uri, "mimeType": "text/plain", "text": format!("{}:{}", config.name, uri) } ]
            }))
        }
        other => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", other)
        })),
    }
}
