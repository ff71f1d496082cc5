// src/http_api.rs

use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::upload::{UploadPolicy, UploadedFile};
use actix_cors::Cors;
use actix_multipart::{Multipart, MultipartError};
use actix_web::{App, HttpResponse, HttpServer, Responder, dev::Server, get, post, web};
use futures_util::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

const HEALTH_MESSAGE: &str = "PLD is working";
const MAX_TEXT_FIELD_BYTES: usize = 1024;

/// How a request without a carrier is treated.
#[derive(Debug, Clone)]
pub struct CarrierPolicy {
    pub default_carrier: String,
    pub required: bool,
}

impl CarrierPolicy {
    fn pick(&self, given: Option<&str>) -> Result<String> {
        match given.map(str::trim).filter(|c| !c.is_empty()) {
            Some(carrier) => Ok(carrier.to_string()),
            None if self.required => Err(PipelineError::Validation(
                "Carrier type not specified.".to_string(),
            )),
            None => Ok(self.default_carrier.clone()),
        }
    }
}

pub struct AppState {
    pub pipeline: Pipeline,
    pub uploads: UploadPolicy,
    pub carrier_policy: CarrierPolicy,
}

#[derive(Default)]
struct CalculateForm {
    carrier: Option<String>,
    file: Option<UploadedFile>,
}

fn bad_upload(err: MultipartError) -> PipelineError {
    PipelineError::Validation(format!("Malformed upload: {err}"))
}

/// Drain the multipart body. The `file` part is streamed to disk under a
/// guard; `carrier` is read as text; other parts are skipped.
async fn read_form(mut payload: Multipart, policy: &UploadPolicy) -> Result<CalculateForm> {
    let mut form = CalculateForm::default();

    while let Some(mut field) = payload.try_next().await.map_err(bad_upload)? {
        let name = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .unwrap_or_default()
            .to_string();

        match name.as_str() {
            "file" => {
                let (upload, mut out) = UploadedFile::create(&policy.dir).await?;
                let mut written = 0usize;
                while let Some(chunk) = field.try_next().await.map_err(bad_upload)? {
                    written += chunk.len();
                    if written > policy.max_bytes {
                        return Err(PipelineError::PayloadTooLarge {
                            limit: policy.max_bytes,
                        });
                    }
                    out.write_all(&chunk).await?;
                }
                out.flush().await?;

                // Browsers send an empty part when no file was picked.
                if written > 0 {
                    form.file = Some(upload);
                }
            }
            "carrier" => {
                let mut text = Vec::new();
                while let Some(chunk) = field.try_next().await.map_err(bad_upload)? {
                    if text.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
                        return Err(PipelineError::Validation(
                            "Carrier field too long.".to_string(),
                        ));
                    }
                    text.extend_from_slice(&chunk);
                }
                let text = String::from_utf8(text).map_err(|_| {
                    PipelineError::Validation("Carrier must be UTF-8 text.".to_string())
                })?;
                form.carrier = Some(text);
            }
            _ => while field.try_next().await.map_err(bad_upload)?.is_some() {},
        }
    }

    Ok(form)
}

#[post("/calculate")]
async fn calculate(state: web::Data<AppState>, payload: Multipart) -> Result<HttpResponse> {
    let span = info_span!("calculate", request_id = %Uuid::new_v4());

    async move {
        let form = read_form(payload, &state.uploads).await?;

        let carrier = state.carrier_policy.pick(form.carrier.as_deref())?;
        let Some(upload) = form.file else {
            return Err(PipelineError::Validation("No file uploaded.".to_string()));
        };
        let carrier = state.pipeline.resolve_carrier(&carrier)?;

        info!(carrier = %carrier, "processing");
        match state.pipeline.run(&carrier, upload.path()).await {
            Ok(report) => Ok(HttpResponse::Ok().json(report)),
            Err(e) => {
                error!(error = %e, "Error processing the file");
                Err(e)
            }
        }
    }
    .instrument(span)
    .await
}

#[get("/healthcheck")]
async fn healthcheck() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(HEALTH_MESSAGE)
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(calculate).service(healthcheck);
}

pub fn start_server(state: AppState, host: &str, port: u16) -> std::io::Result<Server> {
    let state = web::Data::new(state);

    let server = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .configure(routes)
    })
    .bind((host, port))?
    .run();

    Ok(server)
}
