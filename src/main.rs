use actix_web::http::StatusCode;
use actix_web::{web, App, HttpServer};
use tracing::info;

use trigate::classifier::spawn_warmup;
use trigate::config::RouterConfig;
use trigate::server::config_routes;
use trigate::util::{cors_config_from_env, error_response, init_tracing, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = RouterConfig::from_env()?;
    let bind = (config.host.clone(), config.port);
    let body_limit = config.body_limit;

    let state = AppState::from_config(config).await;
    if let Some(classifier) = &state.classifier {
        spawn_warmup(classifier.clone());
    }

    info!(
        host = %bind.0,
        port = bind.1,
        classifier = state.config.classifier.enabled,
        "trigate listening"
    );

    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(data.clone())
            .app_data(web::JsonConfig::default().limit(body_limit).error_handler(
                |err, _req| {
                    actix_web::error::InternalError::from_response(
                        err,
                        error_response(StatusCode::BAD_REQUEST, "invalid_request"),
                    )
                    .into()
                },
            ))
            .configure(config_routes)
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}
