//! A scripted HTTP server for integration tests.
#![allow(dead_code)]

use std::{
    io::Read,
    sync::{Arc, Mutex},
    thread,
};

use tiny_http::{Header, Response, Server};

pub const DEFINITIONS: &str = include_str!("../data/local_evaluation.json");

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A response the server plays back.
#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    body: String,
    headers: Vec<(String, String)>,
}

impl Reply {
    pub fn status(status: u16) -> Reply {
        Reply {
            status,
            body: String::new(),
            headers: Vec::new(),
        }
    }

    pub fn json(body: impl Into<String>) -> Reply {
        Reply::status(200)
            .body(body)
            .header("Content-Type", "application/json")
    }

    pub fn body(mut self, body: impl Into<String>) -> Reply {
        self.body = body.into();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Reply {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }
}

/// A request the server received.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Serves `replies` in order, one per request, then stops accepting.
pub struct ScriptedServer {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl ScriptedServer {
    pub fn start(replies: Vec<Reply>) -> ScriptedServer {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        {
            let requests = requests.clone();
            thread::spawn(move || {
                for reply in replies {
                    let Ok(mut request) = server.recv() else {
                        return;
                    };
                    let mut body = String::new();
                    let _ = request.as_reader().read_to_string(&mut body);
                    requests.lock().unwrap().push(Recorded {
                        method: request.method().to_string(),
                        url: request.url().to_owned(),
                        headers: request
                            .headers()
                            .iter()
                            .map(|header| (header.field.to_string(), header.value.to_string()))
                            .collect(),
                        body,
                    });

                    let mut response =
                        Response::from_string(reply.body).with_status_code(reply.status);
                    for (name, value) in &reply.headers {
                        response = response.with_header(
                            Header::from_bytes(name.as_bytes(), value.as_bytes()).unwrap(),
                        );
                    }
                    let _ = request.respond(response);
                }
            });
        }

        ScriptedServer {
            url: format!("http://{addr}"),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}
