//! `POST /generate` accepts JSON, urlencoded and multipart bodies. All three
//! end up as the same [`GenerationRequest`].

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Context;
use axum::{
    extract::{FromRequest, Multipart, Request},
    http::header::CONTENT_TYPE,
    Form, Json,
};
use serde::Deserialize;
use shape_core::{GenerationRequest, DEFAULT_GUIDANCE_SCALE, DEFAULT_INFERENCE_STEPS};

use crate::error::ApiError;

#[derive(Debug, Default, Deserialize)]
struct JsonParams {
    prompt: Option<String>,
    guidance_scale: Option<f64>,
    num_inference_steps: Option<usize>,
    seed: Option<i64>,
}

/// Extracted and validated generation parameters.
#[derive(Debug)]
pub struct GenerateParams(pub GenerationRequest);

impl<S> FromRequest<S> for GenerateParams
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.contains("application/json") {
            let Json(params) = Json::<JsonParams>::from_request(req, state)
                .await
                .context("failed to parse JSON body")?;
            return from_json(params).map(Self);
        }

        let fields = if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .context("failed to parse form body")?;
            fields
        } else if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .context("failed to parse multipart body")?;
            multipart_fields(multipart).await?
        } else {
            HashMap::new()
        };
        from_fields(&fields).map(Self)
    }
}

async fn multipart_fields(mut multipart: Multipart) -> anyhow::Result<HashMap<String, String>> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .context("failed to read multipart field")?
    {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        let value = field
            .text()
            .await
            .with_context(|| format!("failed to read multipart field {name}"))?;
        fields.insert(name, value);
    }
    Ok(fields)
}

fn from_json(params: JsonParams) -> Result<GenerationRequest, ApiError> {
    build(
        params.prompt,
        params.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE),
        params.num_inference_steps.unwrap_or(DEFAULT_INFERENCE_STEPS),
        params.seed,
    )
}

fn from_fields(fields: &HashMap<String, String>) -> Result<GenerationRequest, ApiError> {
    let guidance_scale = parse_field(fields, "guidance_scale")?.unwrap_or(DEFAULT_GUIDANCE_SCALE);
    let num_inference_steps =
        parse_field(fields, "num_inference_steps")?.unwrap_or(DEFAULT_INFERENCE_STEPS);
    let seed = parse_field(fields, "seed")?;
    build(
        fields.get("prompt").cloned(),
        guidance_scale,
        num_inference_steps,
        seed,
    )
}

/// A blank value counts as absent.
fn parse_field<T>(fields: &HashMap<String, String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match fields.get(name).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => value
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {name}: {value:?}")),
        _ => Ok(None),
    }
}

fn build(
    prompt: Option<String>,
    guidance_scale: f64,
    num_inference_steps: usize,
    seed: Option<i64>,
) -> Result<GenerationRequest, ApiError> {
    let prompt = prompt.filter(|p| !p.is_empty()).ok_or(ApiError::MissingPrompt)?;
    Ok(GenerationRequest {
        prompt,
        guidance_scale,
        num_inference_steps,
        seed: seed.map(|s| s as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn extract(
        content_type: &str,
        body: impl Into<Body>,
    ) -> Result<GenerationRequest, ApiError> {
        let req = Request::builder()
            .method("POST")
            .uri("/generate")
            .header(CONTENT_TYPE, content_type)
            .body(body.into())
            .unwrap();
        GenerateParams::from_request(req, &()).await.map(|p| p.0)
    }

    #[test]
    fn json_and_form_agree() {
        let json: JsonParams = serde_json::from_str(
            r#"{"prompt": "a red chair", "guidance_scale": 7.5,
                "num_inference_steps": 32, "seed": 42}"#,
        )
        .unwrap();
        let form = fields(&[
            ("prompt", "a red chair"),
            ("guidance_scale", "7.5"),
            ("num_inference_steps", " 32 "),
            ("seed", "42"),
        ]);
        assert_eq!(from_json(json).unwrap(), from_fields(&form).unwrap());
    }

    #[test]
    fn omitted_fields_use_defaults() {
        let json: JsonParams =
            serde_json::from_str(r#"{"prompt": "a vase", "seed": null}"#).unwrap();
        let form = fields(&[("prompt", "a vase"), ("seed", "  ")]);
        let expected = GenerationRequest::new("a vase");
        assert_eq!(from_json(json).unwrap(), expected);
        assert_eq!(from_fields(&form).unwrap(), expected);
    }

    #[test]
    fn missing_or_empty_prompt() {
        assert!(matches!(
            from_fields(&fields(&[("seed", "1")])),
            Err(ApiError::MissingPrompt)
        ));
        assert!(matches!(
            from_json(JsonParams {
                prompt: Some(String::new()),
                ..Default::default()
            }),
            Err(ApiError::MissingPrompt)
        ));
    }

    #[test]
    fn bad_number_is_internal() {
        let form = fields(&[("prompt", "a cup"), ("num_inference_steps", "many")]);
        assert!(matches!(from_fields(&form), Err(ApiError::Internal(_))));
    }

    #[test]
    fn negative_seed_wraps() {
        let form = fields(&[("prompt", "a cup"), ("seed", "-1")]);
        assert_eq!(from_fields(&form).unwrap().seed, Some(u64::MAX));
    }

    #[tokio::test]
    async fn urlencoded_body() {
        let request = extract(
            "application/x-www-form-urlencoded",
            "prompt=a+small+boat&guidance_scale=3",
        )
        .await
        .unwrap();
        assert_eq!(request.prompt, "a small boat");
        assert_eq!(request.guidance_scale, 3.0);
        assert_eq!(request.num_inference_steps, 64);
    }

    #[tokio::test]
    async fn multipart_body() {
        let body = "--XBOUNDARY\r\n\
            Content-Disposition: form-data; name=\"prompt\"\r\n\r\n\
            a teapot\r\n\
            --XBOUNDARY\r\n\
            Content-Disposition: form-data; name=\"seed\"\r\n\r\n\
            9\r\n\
            --XBOUNDARY--\r\n";
        let request = extract("multipart/form-data; boundary=XBOUNDARY", body)
            .await
            .unwrap();
        assert_eq!(request.prompt, "a teapot");
        assert_eq!(request.seed, Some(9));
    }

    #[tokio::test]
    async fn unknown_content_type_has_no_fields() {
        let result = extract("text/plain", "prompt=a+lamp").await;
        assert!(matches!(result, Err(ApiError::MissingPrompt)));
    }

    #[tokio::test]
    async fn malformed_json_is_internal() {
        let result = extract("application/json", "{not json").await;
        assert!(matches!(result, Err(ApiError::Internal(_))));
    }
}
