//! Vigil Camserver - Video Alarm Backend
//!
//! Main entry point for the Camserver application.

use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_camserver::{
    camera_manager::CameraManager,
    config_store::ConfigStore,
    detector_client::{FaceClient, YoloClient},
    event_store::InMemoryEventStore,
    frame_distributor::FrameDistributor,
    frame_source::HttpFrameSource,
    motion_signal::MotionTracker,
    overlay::OverlayRenderer,
    pipeline::{DetectionPipelineManager, Detectors},
    realtime_hub::RealtimeHub,
    state::{AppConfig, AppState},
    stream_publisher::{BinarySocketPublisher, MultipartPublisher, StreamPublisher},
    web_api,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil_camserver=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Vigil Camserver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        yolo_url = %config.yolo_url,
        face_url = ?config.face_url,
        yolo_tasks = ?config.yolo_tasks,
        detection_window_ms = config.detection_active_window.as_millis() as u64,
        "Configuration loaded"
    );

    // Detector clients (connect lazily, first call opens the stream)
    let rpc_settings = config.rpc_settings();
    let yolo = Arc::new(YoloClient::connect_lazy(
        &config.yolo_url,
        config.yolo_tasks.clone(),
        rpc_settings.clone(),
    )?);
    let face = match &config.face_url {
        Some(url) => Some(Arc::new(FaceClient::connect_lazy(url, rpc_settings.clone())?)),
        None => {
            tracing::info!("FACE_GRPC_URL not set, face recognition disabled");
            None
        }
    };

    let mut detectors = Detectors::new(yolo.clone());
    if let Some(face) = &face {
        detectors = detectors.with_face(face.clone());
    }

    let overlay = match &config.overlay_font_path {
        Some(path) => match OverlayRenderer::with_font_file(path) {
            Ok(renderer) => renderer,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Overlay font not loaded, labels disabled");
                OverlayRenderer::new()
            }
        },
        None => OverlayRenderer::new(),
    };

    // Core components
    let distributor = Arc::new(FrameDistributor::new());
    let config_store = Arc::new(ConfigStore::default());
    let motion = Arc::new(MotionTracker::new());
    let events = Arc::new(InMemoryEventStore::new(config.event_capacity));
    let realtime = Arc::new(RealtimeHub::new().with_queue_depth(config.hub_queue_depth));

    let pipeline = Arc::new(
        DetectionPipelineManager::new(
            distributor.clone(),
            config_store.clone(),
            motion.clone(),
            detectors,
            events.clone(),
            realtime.clone(),
        )
        .with_overlay(Arc::new(overlay))
        .with_queue_depth(config.subscriber_queue_depth),
    );

    let multipart = Arc::new(MultipartPublisher::new(
        distributor.clone(),
        config.viewer_queue_depth,
    ));
    let binary_socket = Arc::new(
        BinarySocketPublisher::new(distributor.clone(), config.viewer_queue_depth)
            .with_detection_window(config.detection_active_window)
            .with_write_timeout(config.viewer_write_timeout),
    );
    pipeline.add_sink(multipart.clone()).await;
    pipeline.add_sink(binary_socket.clone()).await;

    let publishers: Vec<Arc<dyn StreamPublisher>> = vec![
        multipart.clone() as Arc<dyn StreamPublisher>,
        binary_socket.clone() as Arc<dyn StreamPublisher>,
    ];
    let frame_source = HttpFrameSource::new(distributor.clone())?;
    let cameras = Arc::new(
        CameraManager::new(
            distributor.clone(),
            pipeline.clone(),
            publishers,
            motion.clone(),
            realtime.clone(),
        )
        .with_frame_source(frame_source, config.frame_poll_interval),
    );

    for camera in &config.startup_cameras {
        if let Err(e) = cameras
            .activate(&camera.camera_id, camera.source_url.as_deref())
            .await
        {
            tracing::error!(camera_id = %camera.camera_id, error = %e, "Startup camera activation failed");
        }
    }

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState {
        config: Arc::new(config),
        distributor,
        config_store,
        motion,
        yolo,
        face,
        events,
        realtime,
        pipeline,
        multipart,
        binary_socket,
        cameras: cameras.clone(),
        started_at: Instant::now(),
    };

    let app = web_api::create_router(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cameras.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
