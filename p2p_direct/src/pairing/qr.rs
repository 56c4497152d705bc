use crate::error::SignalingError;
use qrcode::QrCode;
use qrcode::render::unicode::Dense1x2;

/// Render a token as a QR code made of half-block characters, printable in a terminal.
pub fn render_qr(token: &str) -> Result<String, SignalingError> {
    let code =
        QrCode::new(token.as_bytes()).map_err(|e| SignalingError::QrCode(e.to_string()))?;
    Ok(code
        .render::<Dense1x2>()
        .dark_color(Dense1x2::Light)
        .light_color(Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_qr_produces_square_block() {
        let art = render_qr("RAWeyJ2ZXJzaW9uIjoiMSJ9").unwrap();
        let lines: Vec<&str> = art.lines().collect();
        assert!(lines.len() > 10);
        let width = lines[0].chars().count();
        assert!(lines.iter().all(|l| l.chars().count() == width));
    }

    #[test]
    fn test_render_qr_rejects_oversized_token() {
        let token = "x".repeat(8000);
        assert!(matches!(render_qr(&token), Err(SignalingError::QrCode(_))));
    }
}
