//! The server module owns the HTTP surface.  Every request, whatever its path or method, goes
//! to one handler that hands it to the Dispatcher on a blocking thread.

mod error;
pub use error::Error;

use actix_web::http::{header, StatusCode};
use actix_web::middleware::Logger;
use actix_web::rt::time::timeout;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use error::Result;
use log::{error, info};
use snafu::ResultExt;
use std::collections::HashMap;
use std::time::Duration;
use treestore::Store;

use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, Request};
use crate::writer::{self, Response};

/// State shared by every worker.
pub struct Shared<S> {
    pub dispatcher: Dispatcher<S>,
    /// How long one request may spend in the dispatcher.
    pub timeout: Duration,
}

/// Runs the server until it's shut down.
pub async fn serve<S>(config: &ServerConfig, dispatcher: Dispatcher<S>) -> Result<()>
where
    S: Store + 'static,
{
    let shared = web::Data::new(Shared {
        dispatcher,
        timeout: Duration::from_secs(config.store_timeout_secs),
    });
    let max_body = config.max_body_bytes;

    let http_server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .configure(routes(shared.clone(), max_body))
    })
    .workers(config.threads)
    .bind(&config.bind)
    .context(error::BindSocketSnafu { addr: &config.bind })?;

    info!("Listening on {}", config.bind);
    http_server.run().await.context(error::ServerStartSnafu)
}

/// Sends every path to the dispatching handler.  Bodies larger than `max_body` are refused
/// before they reach it.
pub fn routes<S>(
    shared: web::Data<Shared<S>>,
    max_body: usize,
) -> impl FnOnce(&mut web::ServiceConfig)
where
    S: Store + 'static,
{
    move |cfg: &mut web::ServiceConfig| {
        cfg.app_data(shared)
            .app_data(web::PayloadConfig::new(max_body))
            .route("/{tail:.*}", web::to(dispatch::<S>));
    }
}

// Handler

async fn dispatch<S>(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    body: web::Bytes,
    shared: web::Data<Shared<S>>,
) -> HttpResponse
where
    S: Store + 'static,
{
    let query = query.into_inner();
    let request = Request {
        method: req.method().as_str().to_string(),
        path: req.path().to_string(),
        query: query.clone(),
        content_type: req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: body.to_vec(),
    };

    // The store is synchronous, so the dispatch runs on the blocking pool.  If it overruns the
    // deadline the client gets a 500 and the work is abandoned, though it may still finish.
    let worker = shared.clone();
    let blocking = web::block(move || worker.dispatcher.dispatch(&request));
    let response = match timeout(shared.timeout, blocking).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!("{} {} failed to run: {}", req.method(), req.path(), e);
            shared.dispatcher.internal_error(&query)
        }
        Err(_) => {
            error!(
                "{} {} timed out after {:?}",
                req.method(),
                req.path(),
                shared.timeout
            );
            shared.dispatcher.internal_error(&query)
        }
    };

    to_http(response)
}

fn to_http(response: Response) -> HttpResponse {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    if let Some(allow) = response.allow {
        builder.insert_header((header::ALLOW, allow));
    }
    match response.body {
        Some(body) => builder.content_type(writer::CONTENT_TYPE).body(body),
        None => builder.finish(),
    }
}
