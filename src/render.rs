use crate::join::JoinedDataset;
use crate::types::Region;
use anyhow::{Context, Result};
use geo::{BoundingRect, Coord, CoordsIter, LineString, Rect};
use image::{ImageBuffer, ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect as PixelRect;
use std::collections::HashSet;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tracing::info;

const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);
const OUTLINE: Rgba<u8> = Rgba([0, 0, 0, 255]);
const MARKER: Rgba<u8> = Rgba([220, 20, 20, 255]);
const MARGIN: f64 = 10.0;
// side of the square point marker, in pixels
const MARKER_SIZE: u32 = 3;

/// Maps layer coordinates onto image pixels, preserving aspect ratio.
struct Viewport {
    origin: Coord<f64>,
    scale: f64,
    offset_x: f64,
    offset_y: f64,
    height: f64,
}

impl Viewport {
    fn fit(extent: Rect<f64>, width: u32, height: u32) -> Self {
        let avail_w = (width as f64 - 2.0 * MARGIN).max(1.0);
        let avail_h = (height as f64 - 2.0 * MARGIN).max(1.0);
        let (dx, dy) = (extent.width(), extent.height());

        let scale = match (dx > 0.0, dy > 0.0) {
            (true, true) => (avail_w / dx).min(avail_h / dy),
            (true, false) => avail_w / dx,
            (false, true) => avail_h / dy,
            (false, false) => 1.0,
        };

        Viewport {
            origin: extent.min(),
            scale,
            offset_x: MARGIN + (avail_w - dx * scale) / 2.0,
            offset_y: MARGIN + (avail_h - dy * scale) / 2.0,
            height: height as f64,
        }
    }

    fn to_pixel(&self, c: Coord<f64>) -> (f32, f32) {
        let x = self.offset_x + (c.x - self.origin.x) * self.scale;
        // image rows grow downwards
        let y = self.height - (self.offset_y + (c.y - self.origin.y) * self.scale);
        (x.round() as f32, y.round() as f32)
    }
}

/// District outlines with every joined restaurant on top.
pub fn draw_map(dataset: &JoinedDataset, width: u32, height: u32) -> RgbaImage {
    let mut img: RgbaImage = ImageBuffer::from_pixel(width, height, BACKGROUND);

    let Some(extent) = extent(dataset) else {
        return img;
    };
    let view = Viewport::fit(extent, width, height);

    for region in drawable_regions(dataset) {
        let Some(mp) = &region.geometry else { continue };
        for polygon in mp {
            draw_ring(&mut img, &view, polygon.exterior());
            for hole in polygon.interiors() {
                draw_ring(&mut img, &view, hole);
            }
        }
    }

    // records only ever hold validated, finite points
    for record in &dataset.records {
        if let Some(pt) = record.poi.geometry {
            let (px, py) = view.to_pixel(pt.0);
            let half = (MARKER_SIZE / 2) as i32;
            let marker = PixelRect::at(px as i32 - half, py as i32 - half).of_size(MARKER_SIZE, MARKER_SIZE);
            draw_filled_rect_mut(&mut img, marker, MARKER);
        }
    }

    img
}

pub fn save_map(dataset: &JoinedDataset, path: &Path, width: u32, height: u32) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("Failed to create map output directory")?;
    }
    let img = draw_map(dataset, width, height);
    img.save(path).with_context(|| format!("Failed to save map {:?}", path))?;
    info!("Wrote {}x{} map to {:?}", width, height, path);
    Ok(())
}

pub fn encode_png(dataset: &JoinedDataset, width: u32, height: u32) -> Result<Vec<u8>> {
    let img = draw_map(dataset, width, height);
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).context("Failed to encode map as PNG")?;
    Ok(buf.into_inner())
}

/// Districts the joiner accepted. Anything it rejected, non-finite coordinates
/// included, stays off the map and out of the extent.
fn drawable_regions(dataset: &JoinedDataset) -> impl Iterator<Item = &Region> {
    let rejected: HashSet<usize> = dataset.report.invalid_regions.iter().map(|e| e.feature_index()).collect();
    dataset.regions.iter().enumerate().filter_map(move |(i, region)| {
        let finite = region
            .geometry
            .as_ref()
            .is_some_and(|g| g.coords_iter().all(|c| c.x.is_finite() && c.y.is_finite()));
        (finite && !rejected.contains(&i)).then_some(region)
    })
}

fn extent(dataset: &JoinedDataset) -> Option<Rect<f64>> {
    let region_rects = drawable_regions(dataset)
        .filter_map(|r| r.geometry.as_ref())
        .filter_map(|g| g.bounding_rect());
    let point_rects = dataset
        .records
        .iter()
        .filter_map(|r| r.poi.geometry)
        .map(|p| Rect::new(p.0, p.0));

    region_rects
        .chain(point_rects)
        .filter(|r| [r.min().x, r.min().y, r.max().x, r.max().y].iter().all(|v| v.is_finite()))
        .reduce(|a, b| {
            Rect::new(
                Coord { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                Coord { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
            )
        })
}

fn draw_ring(img: &mut RgbaImage, view: &Viewport, ring: &LineString<f64>) {
    for line in ring.lines() {
        draw_line_segment_mut(img, view.to_pixel(line.start), view.to_pixel(line.end), OUTLINE);
    }
}
