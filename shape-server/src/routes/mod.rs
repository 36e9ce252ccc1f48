use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

mod download;
mod generate;
mod status;

/// Any origin, method and header. With `allow_credentials` the request
/// origin is mirrored back together with `access-control-allow-credentials`.
pub fn cors_layer(allow_credentials: bool) -> CorsLayer {
    if allow_credentials {
        CorsLayer::very_permissive()
    } else {
        CorsLayer::permissive()
    }
}

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/status", get(status::status))
        .route("/generate", post(generate::generate))
        .route("/download/{filename}", get(download::download))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputStore;
    use anyhow::Result;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use candle_core::{DType, Device, Tensor};
    use serde_json::Value;
    use shape_core::{
        GaussianDiffusion, LatentDecoder, LatentModel, LoadingStatus, ModelHandles, TriMesh,
    };
    use std::path::PathBuf;
    use tower::ServiceExt;

    struct FlatModel {
        device: Device,
    }

    impl LatentModel for FlatModel {
        fn latent_shape(&self) -> (usize, usize) {
            (2, 3)
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn embed_prompt(&self, _prompt: &str) -> Result<Tensor> {
            Ok(Tensor::ones((1, 4), DType::F32, &self.device)?)
        }

        fn forward(&self, x_t: &Tensor, _t: &Tensor, _cond: &Tensor) -> Result<Tensor> {
            Ok(x_t.zeros_like()?)
        }
    }

    struct TetraDecoder;

    impl LatentDecoder for TetraDecoder {
        fn latent_shape(&self) -> (usize, usize) {
            (2, 3)
        }

        fn decode_mesh(&self, _latent: &Tensor) -> Result<TriMesh> {
            Ok(TriMesh::new(
                vec![
                    [0.0, 0.0, 0.0],
                    [1.0, 0.0, 0.0],
                    [0.0, 1.0, 0.0],
                    [0.0, 0.0, 1.0],
                ],
                vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
            ))
        }
    }

    struct EmptyDecoder;

    impl LatentDecoder for EmptyDecoder {
        fn latent_shape(&self) -> (usize, usize) {
            (2, 3)
        }

        fn decode_mesh(&self, _latent: &Tensor) -> Result<TriMesh> {
            Ok(TriMesh::default())
        }
    }

    fn ready_models() -> ModelHandles {
        ModelHandles {
            transmitter: Some(Arc::new(TetraDecoder)),
            text_model: Some(Arc::new(FlatModel {
                device: Device::Cpu,
            })),
            diffusion: Some(Arc::new(GaussianDiffusion::default())),
        }
    }

    fn app(models: ModelHandles, status: LoadingStatus) -> (Router, PathBuf) {
        let dir = std::env::temp_dir().join(format!("shape-server-{}", uuid::Uuid::new_v4()));
        let state = AppState::new(Device::Cpu, models, status, OutputStore::new(&dir));
        (router(Arc::new(state), cors_layer(false)), dir)
    }

    fn json_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_reports_load_failure() {
        let (app, _) = app(ModelHandles::default(), LoadingStatus::failed("no weights"));
        let response = app.oneshot(get_request("/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["models_loaded"], false);
        assert_eq!(body["model_status"], "error");
        assert_eq!(body["error"], "no weights");
        assert_eq!(body["device"], "cpu");
        assert_eq!(body["model_version"], "text300M");
        assert!(body["model_uptime"].is_string());
    }

    #[tokio::test]
    async fn status_reports_ready() {
        let (app, _) = app(ready_models(), LoadingStatus::loaded());
        let body = json_body(app.oneshot(get_request("/status")).await.unwrap()).await;
        assert_eq!(body["models_loaded"], true);
        assert_eq!(body["model_status"], "loaded");
        assert!(body["error"].is_null());
    }

    #[tokio::test]
    async fn missing_prompt_is_422() {
        let (app, _) = app(ready_models(), LoadingStatus::loaded());

        let response = app.clone().oneshot(json_request("{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["detail"], "Prompt is required");

        let form = Request::builder()
            .method("POST")
            .uri("/generate")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("prompt=&seed=3"))
            .unwrap();
        let response = app.oneshot(form).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn prompt_is_checked_before_readiness() {
        let (app, _) = app(ModelHandles::default(), LoadingStatus::failed("no weights"));

        let response = app.clone().oneshot(json_request("{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = app
            .oneshot(json_request(r#"{"prompt": "a chair"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["detail"], "Models not loaded");
    }

    #[tokio::test]
    async fn zero_steps_is_500() {
        let (app, _) = app(ready_models(), LoadingStatus::loaded());
        let response = app
            .oneshot(json_request(r#"{"prompt": "a chair", "num_inference_steps": 0}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json_body(response).await["detail"].is_string());
    }

    #[tokio::test]
    async fn empty_mesh_is_500_and_writes_nothing() {
        let models = ModelHandles {
            transmitter: Some(Arc::new(EmptyDecoder)),
            ..ready_models()
        };
        let (app, dir) = app(models, LoadingStatus::loaded());
        let response = app
            .oneshot(json_request(r#"{"prompt": "a void", "num_inference_steps": 2}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["detail"], "decoded mesh has no faces");
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn generate_then_download() {
        let (app, dir) = app(ready_models(), LoadingStatus::loaded());
        let response = app
            .clone()
            .oneshot(json_request(
                r#"{"prompt": "a tetrahedron", "num_inference_steps": 2, "seed": 5}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["message"], "3D object generated successfully");
        assert_eq!(body["prompt"], "a tetrahedron");
        let output_id = body["output_id"].as_str().unwrap();
        let download_url = body["download_url"].as_str().unwrap();
        assert_eq!(download_url, format!("/download/{output_id}.obj"));

        let response = app.oneshot(get_request(download_url)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            format!("attachment; filename=\"{output_id}.obj\"")
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let obj = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(obj.starts_with("v "));
        assert_eq!(obj.lines().filter(|l| l.starts_with("f ")).count(), 4);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn unknown_or_escaping_downloads_are_404() {
        let (app, _) = app(ready_models(), LoadingStatus::loaded());

        let response = app
            .clone()
            .oneshot(get_request("/download/nothing.obj"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["detail"], "File not found");

        let response = app
            .oneshot(get_request("/download/..%2F..%2Fetc%2Fpasswd"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_allows_any_origin() {
        let (app, _) = app(ModelHandles::default(), LoadingStatus::default());
        let request = Request::builder()
            .uri("/status")
            .header(header::ORIGIN, "http://example.com")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
            .is_none());
    }
}
