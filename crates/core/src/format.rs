//! Format collaborators: decode and encode raw media into templates
//!
//! The engine only touches formats at explicit decode/encode boundaries (the
//! Open transform and the streaming frame source) and never depends on a
//! specific encoding; these two built-ins cover test fixtures and plain
//! image files.

use crate::params::Parameterized;
use template_pipeline_common::{Mat, ProcessError, Record, Template};

/// Reads and writes raw encoded media as templates. Registered by file
/// extension.
pub trait Format: Parameterized + Send + Sync {
    fn read(&self, record: &Record) -> Result<Template, ProcessError>;
    fn write(&self, template: &Template, record: &Record) -> Result<(), ProcessError>;
}

/// Flat little-endian matrix container: a channel count, then per channel
/// the row and column counts followed by the f32 data.
pub struct RawFormat;

impl Parameterized for RawFormat {
    fn type_name(&self) -> &'static str {
        "raw"
    }
}

impl Format for RawFormat {
    fn read(&self, record: &Record) -> Result<Template, ProcessError> {
        let bytes = std::fs::read(&record.name)?;
        let mut cursor = 0usize;
        let next_u32 = |cursor: &mut usize| -> Result<u32, ProcessError> {
            let end = *cursor + 4;
            let slice = bytes
                .get(*cursor..end)
                .ok_or_else(|| ProcessError::OpenFailed(record.name.clone()))?;
            *cursor = end;
            Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
        };

        let channels = next_u32(&mut cursor)? as usize;
        let mut template = Template::new(record.clone());
        for _ in 0..channels {
            let rows = next_u32(&mut cursor)? as usize;
            let cols = next_u32(&mut cursor)? as usize;
            let mut data = Vec::with_capacity(rows * cols);
            for _ in 0..rows * cols {
                let end = cursor + 4;
                let slice = bytes
                    .get(cursor..end)
                    .ok_or_else(|| ProcessError::OpenFailed(record.name.clone()))?;
                cursor = end;
                data.push(f32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]));
            }
            let mat = Mat::from_shape_vec((rows, cols), data)
                .map_err(|e| ProcessError::ShapeMismatch(e.to_string()))?;
            template.channels.push(mat);
        }
        Ok(template)
    }

    fn write(&self, template: &Template, record: &Record) -> Result<(), ProcessError> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(template.channels.len() as u32).to_le_bytes());
        for channel in &template.channels {
            bytes.extend_from_slice(&(channel.nrows() as u32).to_le_bytes());
            bytes.extend_from_slice(&(channel.ncols() as u32).to_le_bytes());
            for value in channel.iter() {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        std::fs::write(&record.name, bytes)?;
        Ok(())
    }
}

/// Decodes image files to a single luminance channel through the image
/// crate, and encodes single-matrix templates back.
pub struct ImageFormat;

impl Parameterized for ImageFormat {
    fn type_name(&self) -> &'static str {
        "img"
    }
}

impl Format for ImageFormat {
    fn read(&self, record: &Record) -> Result<Template, ProcessError> {
        let image = image::open(&record.name)
            .map_err(|e| ProcessError::OpenFailed(format!("{}: {e}", record.name)))?
            .to_luma8();
        let (width, height) = image.dimensions();
        let mat = Mat::from_shape_fn((height as usize, width as usize), |(r, c)| {
            image.get_pixel(c as u32, r as u32)[0] as f32
        });
        Ok(Template::with_channel(record.clone(), mat))
    }

    fn write(&self, template: &Template, record: &Record) -> Result<(), ProcessError> {
        let mat = template.mat()?;
        let (rows, cols) = mat.dim();
        let mut image = image::GrayImage::new(cols as u32, rows as u32);
        for ((r, c), value) in mat.indexed_iter() {
            image.put_pixel(
                c as u32,
                r as u32,
                image::Luma([value.round().clamp(0.0, 255.0) as u8]),
            );
        }
        image
            .save(&record.name)
            .map_err(|e| ProcessError::Other(format!("image encode failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.raw").display().to_string();
        let record = Record::new(path);

        let mut template = Template::new(record.clone());
        template.channels.push(Mat::from_shape_fn((2, 3), |(r, c)| (r * 3 + c) as f32));
        template.channels.push(Mat::from_elem((1, 1), 42.0));

        RawFormat.write(&template, &record).unwrap();
        let read = RawFormat.read(&record).unwrap();
        assert_eq!(read.channels, template.channels);
    }

    #[test]
    fn test_raw_read_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.raw");
        std::fs::write(&path, [1, 0, 0, 0, 2, 0]).unwrap();
        let record = Record::new(path.display().to_string());
        assert!(RawFormat.read(&record).is_err());
    }

    #[test]
    fn test_image_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.png").display().to_string();
        let record = Record::new(path);

        let mat = Mat::from_shape_fn((4, 5), |(r, c)| ((r * 5 + c) * 10 % 256) as f32);
        let template = Template::with_channel(record.clone(), mat.clone());
        ImageFormat.write(&template, &record).unwrap();

        let read = ImageFormat.read(&record).unwrap();
        assert_eq!(read.channels.len(), 1);
        assert_eq!(read.channels[0], mat);
    }
}
