//! Normalized frame geometry.
//!
//! All coordinates are fractions of the frame: origin top-left, values in
//! `[0, 1]`. Every ratio computed here is guarded so that degenerate or
//! non-finite boxes yield zero overlap instead of NaN.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Length of the frame diagonal in normalized coordinates.
pub const FRAME_DIAGONAL: f64 = std::f64::consts::SQRT_2;

/// Axis-aligned bounding box in normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoundingBox {
    /// Left edge
    pub x: f64,
    /// Top edge
    pub y: f64,
    /// Box width
    #[serde(alias = "w")]
    pub width: f64,
    /// Box height
    #[serde(alias = "h")]
    pub height: f64,
}

impl BoundingBox {
    /// Create a new bounding box.
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a box of the given size centered on `(cx, cy)`.
    pub fn from_center(cx: f64, cy: f64, width: f64, height: f64) -> Self {
        Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
    }

    /// Center x-coordinate.
    #[inline]
    pub fn cx(&self) -> f64 {
        self.x + self.width / 2.0
    }

    /// Center y-coordinate.
    #[inline]
    pub fn cy(&self) -> f64 {
        self.y + self.height / 2.0
    }

    /// Center point.
    #[inline]
    pub fn center(&self) -> (f64, f64) {
        (self.cx(), self.cy())
    }

    /// Right edge.
    #[inline]
    pub fn x2(&self) -> f64 {
        self.x + self.width
    }

    /// Bottom edge.
    #[inline]
    pub fn y2(&self) -> f64 {
        self.y + self.height
    }

    /// Box area as a fraction of the frame.
    #[inline]
    pub fn area(&self) -> f64 {
        if self.is_valid() {
            self.width * self.height
        } else {
            0.0
        }
    }

    /// True when every component is finite and the box has positive extent.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width > 0.0
            && self.height > 0.0
    }

    /// Area of the intersection with another box.
    pub fn intersection_area(&self, other: &BoundingBox) -> f64 {
        if !self.is_valid() || !other.is_valid() {
            return 0.0;
        }

        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        (x2 - x1) * (y2 - y1)
    }

    /// Compute Intersection over Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let intersection = self.intersection_area(other);
        if intersection <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            (intersection / union).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Intersection relative to the smaller of the two boxes.
    ///
    /// Unlike IoU this reaches 1.0 when one box sits entirely inside the other.
    pub fn overlap_ratio(&self, other: &BoundingBox) -> f64 {
        let intersection = self.intersection_area(other);
        let smaller = self.area().min(other.area());
        if intersection > 0.0 && smaller > 0.0 {
            (intersection / smaller).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Euclidean distance between the two centers.
    pub fn center_distance(&self, other: &BoundingBox) -> f64 {
        let dx = self.cx() - other.cx();
        let dy = self.cy() - other.cy();
        let distance = (dx * dx + dy * dy).sqrt();
        if distance.is_finite() {
            distance
        } else {
            FRAME_DIAGONAL
        }
    }

    /// Center distance divided by the frame diagonal, clamped to `[0, 1]`.
    pub fn normalized_center_distance(&self, other: &BoundingBox) -> f64 {
        (self.center_distance(other) / FRAME_DIAGONAL).clamp(0.0, 1.0)
    }

    /// Ratio of the smaller area to the larger one.
    pub fn size_ratio(&self, other: &BoundingBox) -> f64 {
        let a = self.area();
        let b = other.area();
        let larger = a.max(b);
        if larger > 0.0 {
            a.min(b) / larger
        } else {
            0.0
        }
    }

    /// True when `other` lies entirely within this box.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.is_valid()
            && other.is_valid()
            && other.x >= self.x
            && other.y >= self.y
            && other.x2() <= self.x2()
            && other.y2() <= self.y2()
    }

    /// Length of the shared span on the x axis.
    pub fn horizontal_overlap(&self, other: &BoundingBox) -> f64 {
        (self.x2().min(other.x2()) - self.x.max(other.x)).max(0.0)
    }

    /// Shift the box by a velocity.
    pub fn translate(&self, velocity: Velocity) -> BoundingBox {
        BoundingBox {
            x: self.x + velocity.dx,
            y: self.y + velocity.dy,
            width: self.width,
            height: self.height,
        }
    }

    /// Exponential blend: `retain` of this box plus `1 - retain` of `other`.
    pub fn blend(&self, other: &BoundingBox, retain: f64) -> BoundingBox {
        let keep = retain.clamp(0.0, 1.0);
        let take = 1.0 - keep;
        BoundingBox {
            x: self.x * keep + other.x * take,
            y: self.y * keep + other.y * take,
            width: self.width * keep + other.width * take,
            height: self.height * keep + other.height * take,
        }
    }

    /// Clip the box to the unit frame.
    ///
    /// Returns `None` when nothing of the box remains inside the frame or a
    /// component is not finite.
    pub fn clamp_to_frame(&self) -> Option<BoundingBox> {
        if !self.is_valid() {
            return None;
        }

        let x1 = self.x.clamp(0.0, 1.0);
        let y1 = self.y.clamp(0.0, 1.0);
        let x2 = self.x2().clamp(0.0, 1.0);
        let y2 = self.y2().clamp(0.0, 1.0);

        let clipped = BoundingBox::new(x1, y1, x2 - x1, y2 - y1);
        clipped.is_valid().then_some(clipped)
    }
}

/// Per-frame displacement of a box center.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Velocity {
    pub dx: f64,
    pub dy: f64,
}

impl Velocity {
    pub fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }
    }

    /// Displacement between two box centers.
    pub fn between(from: &BoundingBox, to: &BoundingBox) -> Self {
        Self {
            dx: to.cx() - from.cx(),
            dy: to.cy() - from.cy(),
        }
    }

    /// Euclidean length of the displacement.
    pub fn magnitude(&self) -> f64 {
        (self.dx * self.dx + self.dy * self.dy).sqrt()
    }
}
