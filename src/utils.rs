use crate::{
    api::{AnalysisResult, BoundingBox},
    capture::{decode_jpeg, EncodedFrame},
};
use image::{codecs::jpeg::JpegEncoder, DynamicImage, Rgb};
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;

const VEHICLE_LABELS: [&str; 6] = ["car", "truck", "bus", "van", "motorcycle", "vehicle"];

fn box_color(label: &str) -> Rgb<u8> {
    let label = label.to_ascii_lowercase();
    if VEHICLE_LABELS.iter().any(|v| label.contains(v)) {
        Rgb([255, 0, 0])
    } else {
        Rgb([255, 200, 0])
    }
}

/// Draws normalized detection boxes over the frame they were detected in.
pub fn img_with_bbox(detections: &[BoundingBox], jpeg: &[u8]) -> anyhow::Result<DynamicImage> {
    let mut img = decode_jpeg(jpeg)?.to_rgb8();
    let (w, h) = (img.width() as f32, img.height() as f32);

    for detection in detections {
        let x_min = (detection.xmin * w).round() as i32;
        let y_min = (detection.ymin * h).round() as i32;
        let dx = ((detection.xmax - detection.xmin) * w).round() as i32;
        let dy = ((detection.ymax - detection.ymin) * h).round() as i32;

        if dx > 0 && dy > 0 {
            imageproc::drawing::draw_hollow_rect_mut(
                &mut img,
                imageproc::rect::Rect::at(x_min, y_min).of_size(dx as u32, dy as u32),
                box_color(&detection.label),
            );
        }
    }
    Ok(DynamicImage::ImageRgb8(img))
}

pub async fn read_jpeg_file(file_path: &str) -> anyhow::Result<Vec<u8>> {
    let mut file = File::open(file_path).await?;
    let mut contents = vec![];
    file.read_to_end(&mut contents).await?;
    Ok(contents)
}

pub async fn save_image(img: DynamicImage, image_path: &str, suffix: &str) -> anyhow::Result<PathBuf> {
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, 90);
    encoder.encode_image(&img)?;
    let file_path = append_suffix_to_filename(image_path, suffix);
    let mut file = File::create(&file_path).await?;
    file.write_all(&buffer).await?;
    debug!("Saved image: {:?}", file_path);
    Ok(file_path)
}

/// Archives an analyzed frame with its detections drawn in, named after the capture time.
pub async fn save_annotated_frame(
    frame: &EncodedFrame,
    result: &AnalysisResult,
    image_path: &str,
) -> anyhow::Result<PathBuf> {
    ensure_directory_exists(Some(image_path)).await?;
    let detections = result.detected_objects.clone();
    let jpeg = frame.jpeg.clone();
    let img = tokio::task::spawn_blocking(move || img_with_bbox(&detections, &jpeg)).await??;

    let name = format!(
        "{}-{}.jpg",
        frame.captured_at.format("%Y%m%d-%H%M%S"),
        uuid::Uuid::new_v4().simple()
    );
    let path = Path::new(image_path).join(name);
    save_image(img, &path.to_string_lossy(), "-traffic").await
}

pub async fn ensure_directory_exists(path: Option<&str>) -> anyhow::Result<()> {
    if let Some(path) = path {
        let path = Path::new(path);
        if !path.exists() {
            fs::create_dir_all(path).await?;
        }
    }
    Ok(())
}

pub fn append_suffix_to_filename(original_path: &str, suffix: &str) -> PathBuf {
    let path = Path::new(original_path);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

    let mut new_filename = String::from(stem);
    new_filename.push_str(suffix);
    if !extension.is_empty() {
        new_filename.push('.');
        new_filename.push_str(extension);
    }

    path.with_file_name(new_filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::CongestionLevel, capture::tests::test_jpeg};
    use chrono::Local;

    fn detection(label: &str) -> BoundingBox {
        BoundingBox {
            ymin: 0.25,
            xmin: 0.25,
            ymax: 0.75,
            xmax: 0.75,
            label: label.into(),
        }
    }

    #[test]
    fn suffix_goes_before_extension() {
        assert_eq!(
            append_suffix_to_filename("/tmp/cam/frame.jpg", "-traffic"),
            PathBuf::from("/tmp/cam/frame-traffic.jpg")
        );
        assert_eq!(
            append_suffix_to_filename("frame", "-traffic"),
            PathBuf::from("frame-traffic")
        );
    }

    #[test]
    fn boxes_are_drawn_in_pixel_space() {
        let jpeg = test_jpeg(40, 40);
        let img = img_with_bbox(&[detection("Car")], &jpeg).unwrap().to_rgb8();
        assert_eq!((img.width(), img.height()), (40, 40));
        assert_eq!(*img.get_pixel(10, 20), Rgb([255, 0, 0]));
        assert_ne!(*img.get_pixel(20, 20), Rgb([255, 0, 0]));
    }

    #[test]
    fn degenerate_boxes_are_skipped() {
        let jpeg = test_jpeg(16, 16);
        let flat = BoundingBox {
            ymax: 0.25,
            ..detection("Truck")
        };
        assert!(img_with_bbox(&[flat], &jpeg).is_ok());
    }

    #[test]
    fn non_vehicles_get_their_own_color() {
        assert_eq!(box_color("Pedestrian"), Rgb([255, 200, 0]));
        assert_eq!(box_color("pickup truck"), Rgb([255, 0, 0]));
    }

    #[tokio::test]
    async fn annotated_frame_lands_in_archive() {
        let dir = std::env::temp_dir().join(format!("traffic-lens-{}", uuid::Uuid::new_v4()));
        let frame = EncodedFrame {
            jpeg: test_jpeg(32, 32),
            width: 32,
            height: 32,
            captured_at: Local::now(),
        };
        let result = AnalysisResult {
            vehicle_count: 1,
            congestion_level: CongestionLevel::Low,
            description: "one car".into(),
            detected_objects: vec![detection("Car")],
            timestamp: "12:00:00".into(),
            processed_at: 0,
        };

        let path = save_annotated_frame(&frame, &result, &dir.to_string_lossy())
            .await
            .unwrap();
        assert!(path.starts_with(&dir));
        assert!(path.to_string_lossy().ends_with("-traffic.jpg"));
        let written = read_jpeg_file(&path.to_string_lossy()).await.unwrap();
        assert_eq!(&written[..2], &[0xFF, 0xD8]);
        fs::remove_dir_all(&dir).await.unwrap();
    }
}
