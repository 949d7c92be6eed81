use actix_web::body::MessageBody;
use actix_web::dev::{Service, ServiceFactory, ServiceRequest, ServiceResponse};
use actix_web::http::header::{self, HeaderMap, HeaderValue};
use actix_web::http::Method;
use actix_web::{middleware, post, web, App, Error, HttpRequest, HttpResponse, HttpServer};
use anyhow::{anyhow, Result};
use bytes::BytesMut;
use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::config::InviteConfig;
use crate::credentials::get_access_token;
use crate::error::{ErrorBody, InviteError};
use crate::telegram::InviteApi;
use crate::user_store::{Membership, UserRecord, UserStore};

/// Watch time required before an invite is issued.
pub const REQUIRED_MINUTES: f64 = 15.0;

const ALLOW_METHODS: &str = "POST, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization";
const MAX_AGE: &str = "86400";

/// Largest request body read before answering `InvalidJson`.
pub const MAX_BODY_BYTES: usize = 256 * 1024;

/// Everything a request needs; built once and shared by all workers.
pub struct AppState {
    pub config: InviteConfig,
    pub http: reqwest::Client,
    pub users: UserStore,
    pub invites: InviteApi,
}

impl AppState {
    pub fn new(config: InviteConfig) -> Result<Self> {
        let http = reqwest::Client::new();
        let users = UserStore::new(http.clone(), &config.database_url)?;
        let invites = InviteApi::new(http.clone(), &config.telegram_api_url, &config.bot_token);
        Ok(AppState {
            config,
            http,
            users,
            invites,
        })
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InviteRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteResponse {
    pub invite_link: String,
}

/// Issue a single-use invite for a channel the user has earned access to.
///
/// # Example
/// ```shell
/// curl -X POST http://localhost:8080/api/generate-invite \
///   -H 'Content-Type: application/json' \
///   -d '{"userId": "u123", "channelId": "vip"}'
/// ```
///
/// # Returns
/// ```json
/// { "inviteLink": "https://t.me/+AbCdEf" }
/// ```
#[post("/api/generate-invite")]
pub async fn generate_invite(state: web::Data<AppState>, payload: web::Payload) -> HttpResponse {
    let result = match read_body(payload).await {
        Ok(body) => issue_invite(&state, &body).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(link) => HttpResponse::Ok().json(InviteResponse { invite_link: link }),
        Err(err) => {
            match &err {
                InviteError::Server(cause) => error!("generate-invite failed: {:#}", cause),
                other => info!("generate-invite rejected: {} ({})", other.kind(), other),
            }
            err.to_response()
        }
    }
}

/// Collects the request body, refusing anything over `MAX_BODY_BYTES`.
async fn read_body(mut payload: web::Payload) -> Result<BytesMut, InviteError> {
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|err| {
            info!("Could not read request body: {}", err);
            InviteError::InvalidJson
        })?;
        if body.len() + chunk.len() > MAX_BODY_BYTES {
            info!("Request body exceeds {} bytes", MAX_BODY_BYTES);
            return Err(InviteError::InvalidJson);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

async fn issue_invite(state: &AppState, body: &[u8]) -> Result<String, InviteError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| InviteError::InvalidJson)?;
    let request: InviteRequest = serde_json::from_value(value).unwrap_or_default();

    let (user_id, channel_id) = match (request.user_id, request.channel_id) {
        (Some(u), Some(c)) if !u.is_empty() && !c.is_empty() => (u, c),
        _ => return Err(InviteError::MissingFields),
    };

    let channel = state
        .config
        .channels
        .get(&channel_id)
        .ok_or(InviteError::InvalidChannel)?;

    let token = get_access_token(&state.http, state.config.service_account.as_deref()).await;
    if token.is_none() {
        if !state.config.allow_unauthenticated {
            return Err(anyhow!("no database credential and unauthenticated access is disabled").into());
        }
        warn!("No database credential; continuing unauthenticated");
    }
    let token = token.as_deref();

    let user = match state.users.fetch_user(&user_id, token).await {
        Ok(user) => user,
        Err(err) if state.config.strict_user_lookup => return Err(err.into()),
        Err(err) => {
            warn!("Could not read user {}, treating as 0 minutes: {:#}", user_id, err);
            UserRecord::default()
        }
    };

    check_eligibility(&user, &channel_id)?;

    let link = state
        .invites
        .create_invite_link(&channel.id, Utc::now().timestamp())
        .await?
        .ok_or(InviteError::InviteCreationFailed)?;

    let membership = Membership {
        joined_at: Utc::now().timestamp_millis(),
        channel_name: &channel.name,
    };
    if let Err(err) = state
        .users
        .record_membership(&user_id, &channel_id, &membership, token)
        .await
    {
        warn!(
            "Invite issued but membership of {} in {} was not recorded: {:#}",
            user_id, channel_id, err
        );
    }

    Ok(link)
}

/// A user qualifies with enough watch time and no existing membership.
pub fn check_eligibility(user: &UserRecord, channel_id: &str) -> Result<(), InviteError> {
    if user.total_minutes < REQUIRED_MINUTES {
        return Err(InviteError::NotEligible(REQUIRED_MINUTES - user.total_minutes));
    }
    if user.is_member_of(channel_id) {
        return Err(InviteError::AlreadyMember);
    }
    Ok(())
}

/// Preflight requests get an empty 204; anything else unmatched is a 404.
pub async fn fallback(req: HttpRequest) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return HttpResponse::NoContent().finish();
    }
    HttpResponse::NotFound().json(ErrorBody {
        error: "NotFound",
        message: "Not Found".to_string(),
    })
}

/// Echoes the caller's origin back with credentials allowed. Callers without
/// an `Origin` header get a wildcard and no credentials.
pub fn apply_cors(headers: &mut HeaderMap, origin: Option<HeaderValue>) {
    match origin {
        Some(origin) => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        None => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        }
    }
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE));
}

/// Builds the application: one route, the preflight/404 fallback and CORS on every response.
pub fn app(
    state: web::Data<AppState>,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = Error,
        InitError = (),
    >,
> {
    App::new()
        .app_data(state)
        .wrap_fn(|req, srv| {
            let origin = req.headers().get(header::ORIGIN).cloned();
            let fut = srv.call(req);
            async move {
                let mut res = fut.await?;
                apply_cors(res.headers_mut(), origin);
                Ok(res)
            }
        })
        .wrap(middleware::Logger::default())
        .service(generate_invite)
        .default_service(web::to(fallback))
}

/// Run the API server
pub async fn run_api_server(config: InviteConfig) -> Result<()> {
    let bind_addr = config.bind_addr.clone();
    let state = web::Data::new(AppState::new(config)?);

    info!("Serving invites on {}", bind_addr);
    HttpServer::new(move || app(state.clone()))
        .bind(bind_addr)?
        .run()
        .await?;
    Ok(())
}
