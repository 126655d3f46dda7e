// crates/shutter-core/src/profile.rs
//
// Movie profiles: the recognised recording options and their defaults.
//
// Profiles are line-oriented `key=value` text. The "default" profile is the
// base; a caller-selected profile overlays it option by option, so a profile
// file only needs the keys it changes. Reading the files from disk is the
// driver's job; this module only parses and merges.

use std::path::PathBuf;

use crate::movie::{ColorSpace, PixelFormat, VideoFormat};

/// Everything a profile can configure. Field names match the option keys.
#[derive(Clone, Debug)]
pub struct MovieProfile {
    pub video_fps: u32,
    pub video_encoder: String,
    pub video_x264_crf: u32,
    pub video_x264_preset: String,
    pub video_x264_intra: bool,
    pub video_dnxhr_profile: String,
    /// Absolute directory that overrides the default movies folder.
    pub video_output: Option<PathBuf>,

    pub mosample_enabled: bool,
    pub mosample_mult: u32,
    pub mosample_exposure: f64,

    pub audio_enabled: bool,
    pub audio_encoder: String,

    pub velo_enabled: bool,
    pub velo_font: String,
    pub velo_font_size: u32,
    pub velo_font_color: [u8; 4],
    pub velo_border_size: u32,
    pub velo_border_color: [u8; 4],
    /// Percentage alignment from the screen centre, -100..100 per axis.
    pub velo_align: [f32; 2],
    /// When set, velocity is appended as text lines instead of drawn.
    pub velo_output: Option<PathBuf>,
}

impl Default for MovieProfile {
    fn default() -> Self {
        Self {
            video_fps: 60,
            video_encoder: "libx264".into(),
            video_x264_crf: 18,
            video_x264_preset: "veryfast".into(),
            video_x264_intra: false,
            video_dnxhr_profile: "dnxhr_hq".into(),
            video_output: None,
            mosample_enabled: false,
            mosample_mult: 1,
            mosample_exposure: 0.5,
            audio_enabled: false,
            audio_encoder: "aac".into(),
            velo_enabled: false,
            velo_font: "Arial".into(),
            velo_font_size: 72,
            velo_font_color: [255, 255, 255, 255],
            velo_border_size: 0,
            velo_border_color: [0, 0, 0, 255],
            velo_align: [0.0, 80.0],
            velo_output: None,
        }
    }
}

/// A malformed profile line. Unknown keys are not errors (they are skipped
/// so newer profiles keep working with older builds); bad values are.
#[derive(Debug, PartialEq)]
pub struct ProfileError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ProfileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "profile line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ProfileError {}

impl MovieProfile {
    /// Overlay `text` onto this profile. Later keys win; keys absent from
    /// `text` keep their current values.
    pub fn apply(&mut self, text: &str) -> Result<Vec<String>, ProfileError> {
        let mut unknown = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ProfileError {
                line: line_no,
                message: format!("expected key=value, got '{line}'"),
            })?;
            let key = key.trim();
            let value = value.trim();

            let err = |message: String| ProfileError { line: line_no, message };

            match key {
                "video_fps" => {
                    self.video_fps = parse_int(value).map_err(err)?;
                    if self.video_fps == 0 {
                        return Err(ProfileError {
                            line: line_no,
                            message: "video_fps must be positive".into(),
                        });
                    }
                }
                "video_encoder" => self.video_encoder = value.into(),
                "video_x264_crf" => self.video_x264_crf = parse_int(value).map_err(err)?,
                "video_x264_preset" => self.video_x264_preset = value.into(),
                "video_x264_intra" => self.video_x264_intra = parse_bool(value).map_err(err)?,
                "video_dnxhr_profile" => self.video_dnxhr_profile = value.into(),
                "video_output" => self.video_output = Some(PathBuf::from(value)),
                "mosample_enabled" => self.mosample_enabled = parse_bool(value).map_err(err)?,
                "mosample_mult" => {
                    self.mosample_mult = parse_int(value).map_err(err)?;
                    if self.mosample_mult == 0 {
                        return Err(ProfileError {
                            line: line_no,
                            message: "mosample_mult must be positive".into(),
                        });
                    }
                }
                "mosample_exposure" => {
                    let v: f64 = value.parse().map_err(|_| ProfileError {
                        line: line_no,
                        message: format!("'{value}' is not a number"),
                    })?;
                    if !(v > 0.0 && v <= 1.0) {
                        return Err(ProfileError {
                            line: line_no,
                            message: "mosample_exposure must be in (0, 1]".into(),
                        });
                    }
                    self.mosample_exposure = v;
                }
                "audio_enabled" => self.audio_enabled = parse_bool(value).map_err(err)?,
                "audio_encoder" => self.audio_encoder = value.into(),
                "velo_enabled" => self.velo_enabled = parse_bool(value).map_err(err)?,
                "velo_font" => self.velo_font = value.into(),
                "velo_font_size" => self.velo_font_size = parse_int(value).map_err(err)?,
                "velo_font_color" => self.velo_font_color = parse_color(value).map_err(err)?,
                "velo_border_size" => self.velo_border_size = parse_int(value).map_err(err)?,
                "velo_border_color" => self.velo_border_color = parse_color(value).map_err(err)?,
                "velo_align" => {
                    let v = parse_pair(value).map_err(err)?;
                    self.velo_align = v;
                }
                "velo_output" => self.velo_output = Some(PathBuf::from(value)),
                _ => unknown.push(key.to_string()),
            }
        }

        Ok(unknown)
    }

    /// The pixel format implied by the chosen encoder. The format stopped
    /// being separately selectable long ago; the encoder decides.
    pub fn pixel_format(&self) -> VideoFormat {
        match self.video_encoder.as_str() {
            "libx264rgb" => VideoFormat::new(PixelFormat::Bgr0, ColorSpace::Bt601),
            "dnxhr" => VideoFormat::new(PixelFormat::Yuv422, ColorSpace::Bt709),
            _ => VideoFormat::new(PixelFormat::Nv12, ColorSpace::Bt601),
        }
    }

    /// Sub-frame multiplier actually in effect (1 when disabled).
    pub fn effective_mult(&self) -> u32 {
        if self.mosample_enabled {
            self.mosample_mult
        } else {
            1
        }
    }
}

fn parse_int(value: &str) -> Result<u32, String> {
    value.parse().map_err(|_| format!("'{value}' is not an integer"))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(format!("'{value}' is not a boolean (use 0/1)")),
    }
}

fn parse_color(value: &str) -> Result<[u8; 4], String> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 4 {
        return Err(format!("'{value}' is not 'r g b a'"));
    }
    let mut out = [0u8; 4];
    for (dst, part) in out.iter_mut().zip(&parts) {
        *dst = part.parse().map_err(|_| format!("'{part}' is not a byte"))?;
    }
    Ok(out)
}

fn parse_pair(value: &str) -> Result<[f32; 2], String> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 2 {
        return Err(format!("'{value}' is not 'x y'"));
    }
    let x = parts[0].parse().map_err(|_| format!("'{}' is not a number", parts[0]))?;
    let y = parts[1].parse().map_err(|_| format!("'{}' is not a number", parts[1]))?;
    Ok([x, y])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_then_overlay() {
        let mut p = MovieProfile::default();
        assert_eq!(p.video_fps, 60);
        assert!(!p.mosample_enabled);

        let unknown = p
            .apply("video_fps = 120\nmosample_enabled = 1\nmosample_mult = 16\n")
            .unwrap();
        assert!(unknown.is_empty());
        assert_eq!(p.video_fps, 120);
        assert!(p.mosample_enabled);
        assert_eq!(p.mosample_mult, 16);
        // Untouched keys keep the base values.
        assert_eq!(p.video_encoder, "libx264");
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let mut p = MovieProfile::default();
        p.apply("# comment\n; also a comment\n\nvideo_x264_crf = 10\n").unwrap();
        assert_eq!(p.video_x264_crf, 10);
    }

    #[test]
    fn unknown_keys_are_reported_not_fatal() {
        let mut p = MovieProfile::default();
        let unknown = p.apply("mystery_option = 3\nvideo_fps = 30\n").unwrap();
        assert_eq!(unknown, vec!["mystery_option".to_string()]);
        assert_eq!(p.video_fps, 30);
    }

    #[test]
    fn bad_values_are_errors() {
        let mut p = MovieProfile::default();
        assert!(p.apply("video_fps = sixty\n").is_err());
        assert!(p.apply("mosample_exposure = 0\n").is_err());
        assert!(p.apply("mosample_exposure = 1.5\n").is_err());
        assert!(p.apply("mosample_mult = 0\n").is_err());
        assert!(p.apply("not a pair\n").is_err());
    }

    #[test]
    fn encoder_selects_pixel_format() {
        let mut p = MovieProfile::default();
        assert_eq!(p.pixel_format().pixel, PixelFormat::Nv12);
        assert_eq!(p.pixel_format().space, ColorSpace::Bt601);

        p.apply("video_encoder = libx264rgb\n").unwrap();
        assert_eq!(p.pixel_format().pixel, PixelFormat::Bgr0);

        p.apply("video_encoder = dnxhr\n").unwrap();
        assert_eq!(p.pixel_format().pixel, PixelFormat::Yuv422);
        assert_eq!(p.pixel_format().space, ColorSpace::Bt709);
    }

    #[test]
    fn velo_options_parse() {
        let mut p = MovieProfile::default();
        p.apply("velo_enabled = 1\nvelo_font_color = 10 20 30 255\nvelo_align = -25 80\n")
            .unwrap();
        assert!(p.velo_enabled);
        assert_eq!(p.velo_font_color, [10, 20, 30, 255]);
        assert_eq!(p.velo_align, [-25.0, 80.0]);
    }
}
