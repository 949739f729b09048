//! detection — per-frame detection records and box geometry
//!
//! Boxes come from the tracker in centre/size form (`cx cy w h`), either
//! normalised to `[0, 1]` or in pixels. Nothing here cares which, as long as
//! both operands of a comparison use the same space.

use serde::Serialize;

use crate::config::Band;

// ── Public types ─────────────────────────────────────────────────────────────

/// Axis-aligned bounding box in centre/size form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
    pub cx: f64,
    pub cy: f64,
    pub w: f64,
    pub h: f64,
}

impl BBox {
    pub fn new(cx: f64, cy: f64, w: f64, h: f64) -> Self {
        Self { cx, cy, w, h }
    }

    pub fn x_min(&self) -> f64 {
        self.cx - self.w / 2.0
    }
    pub fn x_max(&self) -> f64 {
        self.cx + self.w / 2.0
    }
    pub fn y_min(&self) -> f64 {
        self.cy - self.h / 2.0
    }
    pub fn y_max(&self) -> f64 {
        self.cy + self.h / 2.0
    }

    /// True iff the two extents intersect. Touching edges count: the boxes are
    /// disjoint only when one's max edge is strictly below the other's min
    /// edge on some axis.
    pub fn overlaps(&self, other: &BBox) -> bool {
        !(self.x_max() < other.x_min()
            || self.x_min() > other.x_max()
            || self.y_max() < other.y_min()
            || self.y_min() > other.y_max())
    }

    /// Whole horizontal extent strictly inside `band`.
    pub fn within_band(&self, band: &Band) -> bool {
        self.x_min() > band.x_min && self.x_max() < band.x_max
    }

    /// Pixel-space corners `(x1, y1, x2, y2)`. Normalised boxes are scaled by
    /// the frame size.
    pub fn to_pixel_corners(&self, frame_w: u32, frame_h: u32, normalized: bool) -> (f64, f64, f64, f64) {
        let (sx, sy) = if normalized {
            (frame_w as f64, frame_h as f64)
        } else {
            (1.0, 1.0)
        };
        (
            self.x_min() * sx,
            self.y_min() * sy,
            self.x_max() * sx,
            self.y_max() * sy,
        )
    }
}

/// One tracked box observed in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub bbox: BBox,
    /// Identity assigned by the external tracker, stable across frames.
    pub track_id: u32,
}

impl Detection {
    pub fn overlaps(&self, other: &Detection) -> bool {
        self.bbox.overlaps(&other.bbox)
    }
}

/// Keep the detections that lie entirely inside `band`. A box straddling
/// either edge is dropped, not clipped.
pub fn filter_region<'a>(detections: &'a [Detection], band: &Band) -> Vec<&'a Detection> {
    detections
        .iter()
        .filter(|d| d.bbox.within_band(band))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(track_id: u32, cx: f64, cy: f64, w: f64, h: f64) -> Detection {
        Detection {
            class_id: 0,
            bbox: BBox::new(cx, cy, w, h),
            track_id,
        }
    }

    #[test]
    fn test_overlap_basic() {
        let a = BBox::new(0.5, 0.5, 0.2, 0.2);
        let b = BBox::new(0.65, 0.5, 0.2, 0.2);
        let c = BBox::new(0.9, 0.9, 0.05, 0.05);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_overlap_is_symmetric() {
        let boxes = [
            BBox::new(0.5, 0.5, 0.2, 0.2),
            BBox::new(0.6, 0.55, 0.1, 0.3),
            BBox::new(0.1, 0.1, 0.05, 0.05),
            BBox::new(0.5, 0.5, 0.0, 0.0),
            BBox::new(100.0, 40.0, 30.0, 12.0),
        ];
        for a in &boxes {
            for b in &boxes {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn test_overlap_is_reflexive() {
        for b in [
            BBox::new(0.5, 0.5, 0.2, 0.2),
            BBox::new(320.0, 240.0, 18.0, 9.0),
        ] {
            assert!(b.overlaps(&b));
        }
    }

    #[test]
    fn test_touching_edges_overlap() {
        // a spans x in [0, 2], b spans x in [2, 4]
        let a = BBox::new(1.0, 1.0, 2.0, 2.0);
        let b = BBox::new(3.0, 1.0, 2.0, 2.0);
        assert!(a.overlaps(&b));

        let gap = BBox::new(3.5, 1.0, 2.0, 2.0);
        assert!(!a.overlaps(&gap));
    }

    #[test]
    fn test_degenerate_boxes() {
        let p = BBox::new(0.5, 0.5, 0.0, 0.0);
        assert!(p.overlaps(&BBox::new(0.5, 0.5, 0.0, 0.0)));
        assert!(!p.overlaps(&BBox::new(0.5, 0.5001, 0.0, 0.0)));
        // A point on the edge of a real box touches it
        let point = BBox::new(50.0, 50.0, 0.0, 0.0);
        assert!(point.overlaps(&BBox::new(60.0, 50.0, 20.0, 20.0)));
    }

    #[test]
    fn test_region_filter_excludes_straddlers() {
        let band = Band::new(0.3, 0.7).unwrap();
        let dets = vec![
            det(1, 0.5, 0.5, 0.1, 0.1),  // inside
            det(2, 0.31, 0.5, 0.1, 0.1), // crosses left edge
            det(3, 0.68, 0.5, 0.1, 0.1), // crosses right edge
            det(4, 0.1, 0.5, 0.1, 0.1),  // outside
        ];
        let kept: Vec<u32> = filter_region(&dets, &band).iter().map(|d| d.track_id).collect();
        assert_eq!(kept, vec![1]);
    }

    #[test]
    fn test_region_filter_touching_edge_is_excluded() {
        let band = Band::new(100.0, 200.0).unwrap();
        let touching_left = det(1, 110.0, 0.0, 20.0, 10.0);
        let touching_right = det(2, 190.0, 0.0, 20.0, 10.0);
        let inside = det(3, 150.0, 0.0, 20.0, 10.0);
        let kept: Vec<u32> = filter_region(&[touching_left, touching_right, inside], &band)
            .iter()
            .map(|d| d.track_id)
            .collect();
        assert_eq!(kept, vec![3]);
    }

    #[test]
    fn test_region_filter_is_monotonic() {
        let dets: Vec<Detection> = (0..20)
            .map(|i| det(i, 0.05 * i as f64, 0.5, 0.04 + 0.003 * i as f64, 0.1))
            .collect();
        let wide = Band::new(0.1, 0.9).unwrap();
        let narrow = Band::new(0.3, 0.6).unwrap();
        let wide_ids: Vec<u32> = filter_region(&dets, &wide).iter().map(|d| d.track_id).collect();
        for d in filter_region(&dets, &narrow) {
            assert!(wide_ids.contains(&d.track_id));
        }
    }

    #[test]
    fn test_pixel_corners() {
        let b = BBox::new(0.5, 0.25, 0.1, 0.2);
        let (x1, y1, x2, y2) = b.to_pixel_corners(200, 100, true);
        approx::assert_abs_diff_eq!(x1, 90.0, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(y1, 15.0, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(x2, 110.0, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(y2, 35.0, epsilon = 1e-9);

        let px = BBox::new(50.0, 50.0, 10.0, 20.0);
        assert_eq!(px.to_pixel_corners(200, 100, false), (45.0, 40.0, 55.0, 60.0));
    }
}
