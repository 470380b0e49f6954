use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Requested capture size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(320, 240)
    }
}

fn default_jetson_resolution() -> Resolution {
    Resolution::new(1920, 1080)
}

/// The camera attached to a Jetson board.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JetsonCamera {
    /// USB camera at `/dev/video{device}`.
    Usb {
        #[serde(default)]
        device: u32,
    },
    /// CSI camera on the board itself.
    #[default]
    Onboard,
    /// H.264 RTSP network camera decoded by the hardware decoder.
    Rtsp {
        url: String,
        #[serde(default)]
        latency_ms: u32,
    },
}

/// Which camera backend to build.
///
/// This is a closed set. The variant is chosen explicitly by the caller,
/// either from a config file or from [SourceConfig::from_selector].
///
/// ```toml
/// type = "jetson"
/// resolution = { width = 1280, height = 720 }
///
/// [camera]
/// kind = "usb"
/// device = 1
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Webcam {
        #[serde(default)]
        device: u32,
        #[serde(default)]
        resolution: Resolution,
    },
    #[serde(rename = "ipcam")]
    IpCam { url: String },
    #[serde(rename = "picam")]
    PiCam {
        #[serde(default)]
        resolution: Resolution,
    },
    Jetson {
        #[serde(default)]
        camera: JetsonCamera,
        #[serde(default = "default_jetson_resolution")]
        resolution: Resolution,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Webcam {
            device: 0,
            resolution: Resolution::default(),
        }
    }
}

impl std::fmt::Display for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceConfig::Webcam { device, .. } => write!(f, "webcam {device}"),
            SourceConfig::IpCam { url } => write!(f, "ipcam {url}"),
            SourceConfig::PiCam { .. } => write!(f, "picam"),
            SourceConfig::Jetson { camera, .. } => match camera {
                JetsonCamera::Usb { device } => write!(f, "jetson usb {device}"),
                JetsonCamera::Onboard => write!(f, "jetson onboard"),
                JetsonCamera::Rtsp { url, .. } => write!(f, "jetson rtsp {url}"),
            },
        }
    }
}

impl SourceConfig {
    /// Parse the short camera selector given on the command line.
    ///
    /// * `default` or an integer: webcam with that device index
    /// * `picam`: Raspberry Pi camera
    /// * `jetson`: Jetson onboard camera
    /// * `http://...`, `https://...` or `rtsp://...`: IP camera
    pub fn from_selector(selector: &str) -> Result<Self> {
        let selector = selector.trim();
        if selector.eq_ignore_ascii_case("default") {
            return Ok(Self::default());
        }
        if let Ok(device) = selector.parse::<u32>() {
            return Ok(SourceConfig::Webcam {
                device,
                resolution: Resolution::default(),
            });
        }
        match selector.to_ascii_lowercase().as_str() {
            "picam" => {
                return Ok(SourceConfig::PiCam {
                    resolution: Resolution::default(),
                });
            }
            "jetson" => {
                return Ok(SourceConfig::Jetson {
                    camera: JetsonCamera::Onboard,
                    resolution: default_jetson_resolution(),
                });
            }
            _ => {}
        }
        if let Ok(parsed) = url::Url::parse(selector) {
            if matches!(parsed.scheme(), "http" | "https" | "rtsp") {
                return Ok(SourceConfig::IpCam {
                    url: selector.to_string(),
                });
            }
        }
        Err(Error::UnsupportedSource(format!(
            "\"{selector}\" (valid sources are a webcam index, picam, jetson or an http/rtsp url)"
        )))
    }

    /// Check that this source can be used on the current platform.
    ///
    /// This never touches hardware.
    pub fn check_platform(&self) -> Result<()> {
        self.check_platform_for(std::env::consts::OS)
    }

    pub(crate) fn check_platform_for(&self, os: &str) -> Result<()> {
        match self {
            SourceConfig::PiCam { .. } if os != "linux" => Err(Error::UnsupportedSource(format!(
                "the Pi camera requires linux, not {os}"
            ))),
            SourceConfig::Jetson { .. } if os != "linux" => Err(Error::UnsupportedSource(
                format!("the Jetson camera requires linux, not {os}"),
            )),
            _ => Ok(()),
        }
    }

    /// Validate parameters and platform before any backend is constructed.
    pub fn validate(&self) -> Result<()> {
        self.check_platform()?;
        let resolution = match self {
            SourceConfig::Webcam { resolution, .. }
            | SourceConfig::PiCam { resolution }
            | SourceConfig::Jetson { resolution, .. } => Some(resolution),
            SourceConfig::IpCam { .. } => None,
        };
        if let Some(r) = resolution {
            if r.width == 0 || r.height == 0 {
                return Err(Error::UnsupportedSource(format!(
                    "invalid resolution {}x{}",
                    r.width, r.height
                )));
            }
        }
        match self {
            SourceConfig::IpCam { url } => check_url(url, &["http", "https", "rtsp"]),
            SourceConfig::Jetson {
                camera: JetsonCamera::Rtsp { url, .. },
                ..
            } => check_url(url, &["rtsp"]),
            _ => Ok(()),
        }
    }

    /// GStreamer pipeline description producing raw video.
    ///
    /// The description ends before color conversion and the sink. Backends
    /// append their own tail.
    pub fn pipeline_description(&self) -> String {
        self.pipeline_description_for(std::env::consts::OS)
    }

    pub(crate) fn pipeline_description_for(&self, os: &str) -> String {
        match self {
            SourceConfig::Webcam { device, resolution } => {
                let src = match os {
                    "macos" => format!("avfvideosrc device-index={device}"),
                    "windows" => format!("ksvideosrc device-index={device}"),
                    _ => format!("v4l2src device=/dev/video{device}"),
                };
                format!(
                    "{src} ! videoconvert ! videoscale ! video/x-raw,width={},height={}",
                    resolution.width, resolution.height
                )
            }
            SourceConfig::IpCam { url } => {
                if url.starts_with("rtsp") {
                    format!("rtspsrc location={url} latency=0 ! decodebin")
                } else {
                    format!(
                        "souphttpsrc location={url} is-live=true do-timestamp=true ! multipartdemux ! jpegdec"
                    )
                }
            }
            SourceConfig::PiCam { resolution } => format!(
                "libcamerasrc ! video/x-raw,width={},height={},framerate=30/1",
                resolution.width, resolution.height
            ),
            SourceConfig::Jetson { camera, resolution } => {
                let (w, h) = (resolution.width, resolution.height);
                match camera {
                    JetsonCamera::Usb { device } => format!(
                        "v4l2src device=/dev/video{device} ! \
                         video/x-raw,width=(int){w},height=(int){h},format=I420,framerate=30/1"
                    ),
                    JetsonCamera::Onboard => format!(
                        "nvarguscamerasrc ! \
                         video/x-raw(memory:NVMM),width=(int)2592,height=(int)1458,format=(string)NV12,framerate=(fraction)30/1 ! \
                         nvvidconv ! video/x-raw,width=(int){w},height=(int){h},format=(string)BGRx"
                    ),
                    JetsonCamera::Rtsp { url, latency_ms } => format!(
                        "rtspsrc location={url} latency={latency_ms} ! rtph264depay ! h264parse ! omxh264dec ! \
                         nvvidconv ! video/x-raw,width=(int){w},height=(int){h},format=(string)BGRx"
                    ),
                }
            }
        }
    }
}

fn check_url(url: &str, schemes: &[&str]) -> Result<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| Error::UnsupportedSource(format!("invalid camera url \"{url}\": {e}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(Error::UnsupportedSource(format!(
            "camera url scheme \"{}\" not one of {}",
            parsed.scheme(),
            schemes.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parsing() {
        assert_eq!(
            SourceConfig::from_selector("2").unwrap(),
            SourceConfig::Webcam {
                device: 2,
                resolution: Resolution::default()
            }
        );
        assert_eq!(
            SourceConfig::from_selector("default").unwrap(),
            SourceConfig::default()
        );
        assert!(matches!(
            SourceConfig::from_selector("picam").unwrap(),
            SourceConfig::PiCam { .. }
        ));
        assert!(matches!(
            SourceConfig::from_selector("jetson").unwrap(),
            SourceConfig::Jetson {
                camera: JetsonCamera::Onboard,
                ..
            }
        ));
        let ip = SourceConfig::from_selector("http://10.15.18.101/mjpg/video.mjpg").unwrap();
        assert_eq!(
            ip,
            SourceConfig::IpCam {
                url: "http://10.15.18.101/mjpg/video.mjpg".into()
            }
        );
        match SourceConfig::from_selector("kinect") {
            Err(Error::UnsupportedSource(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn board_cameras_need_linux() {
        let pi = SourceConfig::PiCam {
            resolution: Resolution::default(),
        };
        assert!(pi.check_platform_for("linux").is_ok());
        assert!(matches!(
            pi.check_platform_for("macos"),
            Err(Error::UnsupportedSource(_))
        ));
        let jetson = SourceConfig::Jetson {
            camera: JetsonCamera::Onboard,
            resolution: default_jetson_resolution(),
        };
        assert!(matches!(
            jetson.check_platform_for("windows"),
            Err(Error::UnsupportedSource(_))
        ));
        assert!(SourceConfig::default().check_platform_for("windows").is_ok());
    }

    #[test]
    fn validate_rejects_bad_parameters() {
        let zero = SourceConfig::Webcam {
            device: 0,
            resolution: Resolution::new(0, 240),
        };
        assert!(matches!(zero.validate(), Err(Error::UnsupportedSource(_))));

        let ftp = SourceConfig::IpCam {
            url: "ftp://camera.local/stream".into(),
        };
        assert!(matches!(ftp.validate(), Err(Error::UnsupportedSource(_))));

        let ok = SourceConfig::IpCam {
            url: "rtsp://camera.local/stream".into(),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn pipeline_descriptions() {
        let webcam = SourceConfig::Webcam {
            device: 1,
            resolution: Resolution::new(640, 480),
        };
        assert_eq!(
            webcam.pipeline_description_for("linux"),
            "v4l2src device=/dev/video1 ! videoconvert ! videoscale ! video/x-raw,width=640,height=480"
        );
        assert!(
            webcam
                .pipeline_description_for("macos")
                .starts_with("avfvideosrc device-index=1")
        );

        let usb = SourceConfig::Jetson {
            camera: JetsonCamera::Usb { device: 0 },
            resolution: Resolution::new(1280, 720),
        };
        let desc = usb.pipeline_description_for("linux");
        assert!(desc.starts_with("v4l2src device=/dev/video0"));
        assert!(desc.contains("width=(int)1280,height=(int)720"));

        let rtsp = SourceConfig::Jetson {
            camera: JetsonCamera::Rtsp {
                url: "rtsp://10.0.0.2/live".into(),
                latency_ms: 200,
            },
            resolution: Resolution::new(1920, 1080),
        };
        let desc = rtsp.pipeline_description_for("linux");
        assert!(desc.starts_with("rtspsrc location=rtsp://10.0.0.2/live latency=200"));
        assert!(desc.contains("omxh264dec"));

        let mjpeg = SourceConfig::IpCam {
            url: "http://cam/video.mjpg".into(),
        };
        assert!(mjpeg.pipeline_description_for("linux").contains("jpegdec"));
    }

    #[test]
    fn config_from_toml() {
        let buf = r#"
            type = "jetson"
            resolution = { width = 1280, height = 720 }

            [camera]
            kind = "usb"
            device = 1
        "#;
        let cfg: SourceConfig = toml::from_str(buf).unwrap();
        assert_eq!(
            cfg,
            SourceConfig::Jetson {
                camera: JetsonCamera::Usb { device: 1 },
                resolution: Resolution::new(1280, 720),
            }
        );

        let cfg: SourceConfig = toml::from_str(r#"type = "webcam""#).unwrap();
        assert_eq!(cfg, SourceConfig::default());

        let cfg: SourceConfig = toml::from_str(
            r#"
            type = "ipcam"
            url = "http://10.15.18.101/mjpg/video.mjpg"
        "#,
        )
        .unwrap();
        assert!(matches!(cfg, SourceConfig::IpCam { .. }));
    }
}
