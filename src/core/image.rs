use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ImageError {
    #[error("Frame geometry mismatch: expected {expected_rows}x{expected_columns}, found {rows}x{columns}")]
    DimensionMismatch {
        expected_rows: usize,
        expected_columns: usize,
        rows: usize,
        columns: usize,
    },

    #[error("Pixel count {found} does not match {rows}x{columns}")]
    PixelCount {
        rows: usize,
        columns: usize,
        found: usize,
    },
}

/// Single-channel detector image stored row-major
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    rows: usize,
    columns: usize,
    pixels: Vec<f32>,
}

impl Image {
    pub fn new(rows: usize, columns: usize, pixels: Vec<f32>) -> Result<Self, ImageError> {
        if rows.checked_mul(columns) != Some(pixels.len()) {
            return Err(ImageError::PixelCount {
                rows,
                columns,
                found: pixels.len(),
            });
        }
        Ok(Self {
            rows,
            columns,
            pixels,
        })
    }

    pub fn zeros(rows: usize, columns: usize) -> Self {
        Self {
            rows,
            columns,
            pixels: vec![0.0; rows * columns],
        }
    }

    /// Widen raw 16-bit detector counts
    pub fn from_u16(rows: usize, columns: usize, raw: &[u16]) -> Result<Self, ImageError> {
        Self::new(rows, columns, raw.iter().map(|&v| v as f32).collect())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// Fails with `DimensionMismatch` unless `other` has this image's geometry
    pub fn check_geometry(&self, other: &Image) -> Result<(), ImageError> {
        if self.rows != other.rows || self.columns != other.columns {
            return Err(ImageError::DimensionMismatch {
                expected_rows: self.rows,
                expected_columns: self.columns,
                rows: other.rows,
                columns: other.columns,
            });
        }
        Ok(())
    }

    /// Pixel-wise `self - other`
    pub fn subtract(&self, other: &Image) -> Result<Image, ImageError> {
        self.check_geometry(other)?;
        let pixels = self
            .pixels
            .iter()
            .zip(other.pixels.iter())
            .map(|(a, b)| a - b)
            .collect();
        Ok(Image {
            rows: self.rows,
            columns: self.columns,
            pixels,
        })
    }

    /// Little-endian f32 pixel bytes, row-major
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.pixels.len() * 4);
        for px in &self.pixels {
            bytes.extend_from_slice(&px.to_le_bytes());
        }
        bytes
    }

    pub fn from_le_bytes(rows: usize, columns: usize, bytes: &[u8]) -> Result<Self, ImageError> {
        let expected = rows.checked_mul(columns).and_then(|n| n.checked_mul(4));
        if expected != Some(bytes.len()) {
            return Err(ImageError::PixelCount {
                rows,
                columns,
                found: bytes.len() / 4,
            });
        }
        let pixels = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(rows, columns, pixels)
    }
}
