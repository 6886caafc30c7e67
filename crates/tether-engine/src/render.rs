use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to render pairing code: {0}")]
pub struct RenderError(pub String);

/// Turns a pairing code into something a user can scan.
pub trait PairingRenderer: Send + Sync {
    fn render(&self, code: &str) -> Result<String, RenderError>;
}

/// Renders a QR code as an `image/svg+xml` data URL.
#[derive(Clone, Debug)]
pub struct QrSvgRenderer {
    min_size: u32,
}

impl Default for QrSvgRenderer {
    fn default() -> Self {
        Self { min_size: 256 }
    }
}

impl QrSvgRenderer {
    pub fn with_min_size(min_size: u32) -> Self {
        Self { min_size }
    }
}

impl PairingRenderer for QrSvgRenderer {
    fn render(&self, code: &str) -> Result<String, RenderError> {
        let qr = QrCode::new(code.as_bytes()).map_err(|e| RenderError(e.to_string()))?;
        let image = qr
            .render::<svg::Color<'_>>()
            .min_dimensions(self.min_size, self.min_size)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#ffffff"))
            .build();
        Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
    }
}
