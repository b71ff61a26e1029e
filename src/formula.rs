//! Haversine great-circle distance
//!
//! The formula exists in two equivalent forms:
//! - [`haversine`]: the canonical native function
//! - [`Expr`]: the same operations, in the same order, as a tree that the
//!   interpreted backend walks and the JIT backends lower to machine code
//!
//! Both use `R = 6372.8 km` and clamp `sqrt(a)` to `[-1, 1]` before `asin`,
//! so antipodal inputs never leave the `asin` domain.

use serde::{Deserialize, Serialize};

/// Earth radius used by every backend (km)
pub const EARTH_RADIUS_KM: f64 = 6372.8;

/// Degrees → radians factor (identical to `f64::to_radians`)
pub const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

/// Two points as (longitude, latitude) in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinatePair {
    /// Longitude of point A
    pub x0: f64,
    /// Latitude of point A
    pub y0: f64,
    /// Longitude of point B
    pub x1: f64,
    /// Latitude of point B
    pub y1: f64,
}

impl CoordinatePair {
    /// Create a coordinate pair
    #[must_use]
    pub const fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Distance between A and B in km
    #[must_use]
    pub fn distance(&self) -> f64 {
        haversine(self.x0, self.y0, self.x1, self.y1)
    }

    /// Pair with A and B swapped
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self::new(self.x1, self.y1, self.x0, self.y0)
    }
}

#[inline(always)]
fn square(x: f64) -> f64 {
    x * x
}

/// Great-circle distance in km between `(x0, y0)` and `(x1, y1)`
///
/// `x` is longitude, `y` latitude, both in degrees. NaN inputs yield NaN.
///
/// # Example
/// ```
/// use haversine_udf::formula::haversine;
///
/// assert_eq!(haversine(13.4, 52.5, 13.4, 52.5), 0.0);
/// let one_degree = haversine(0.0, 0.0, 0.0, 1.0);
/// assert!((one_degree - 111.226).abs() < 0.01);
/// ```
#[inline]
#[must_use]
pub fn haversine(x0: f64, y0: f64, x1: f64, y1: f64) -> f64 {
    let lat0 = y0 * DEG_TO_RAD;
    let lat1 = y1 * DEG_TO_RAD;
    let delta_lat = (y1 - y0) * DEG_TO_RAD;
    let delta_lon = (x1 - x0) * DEG_TO_RAD;

    let a = square((delta_lat / 2.0).sin())
        + lat0.cos() * lat1.cos() * square((delta_lon / 2.0).sin());
    let central_angle = 2.0 * a.sqrt().clamp(-1.0, 1.0).asin();

    EARTH_RADIUS_KM * central_angle
}

/// Input column of the distance function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Longitude of point A
    X0 = 0,
    /// Latitude of point A
    Y0 = 1,
    /// Longitude of point B
    X1 = 2,
    /// Latitude of point B
    Y1 = 3,
}

/// Unary operations of the formula tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `sin(x)`
    Sin,
    /// `cos(x)`
    Cos,
    /// `asin(x)`
    Asin,
    /// `sqrt(x)`
    Sqrt,
    /// `x * x`
    Square,
}

/// Binary operations of the formula tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `l + r`
    Add,
    /// `l - r`
    Sub,
    /// `l * r`
    Mul,
    /// `l / r`
    Div,
}

/// Formula expression tree over the four inputs
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Input column value of the current row
    Input(Input),
    /// Constant
    Const(f64),
    /// Unary operation
    Unary(UnaryOp, Box<Expr>),
    /// Binary operation
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `x.clamp(lo, hi)` with NaN passing through
    Clamp(Box<Expr>, f64, f64),
}

impl Expr {
    fn unary(op: UnaryOp, e: Self) -> Self {
        Self::Unary(op, Box::new(e))
    }

    fn binary(op: BinaryOp, l: Self, r: Self) -> Self {
        Self::Binary(op, Box::new(l), Box::new(r))
    }

    /// Evaluate the tree for one row
    #[must_use]
    pub fn eval(&self, row: &[f64; 4]) -> f64 {
        match self {
            Self::Input(input) => row[*input as usize],
            Self::Const(c) => *c,
            Self::Unary(op, e) => {
                let v = e.eval(row);
                match op {
                    UnaryOp::Sin => v.sin(),
                    UnaryOp::Cos => v.cos(),
                    UnaryOp::Asin => v.asin(),
                    UnaryOp::Sqrt => v.sqrt(),
                    UnaryOp::Square => v * v,
                }
            }
            Self::Binary(op, l, r) => {
                let (l, r) = (l.eval(row), r.eval(row));
                match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => l / r,
                }
            }
            Self::Clamp(e, lo, hi) => e.eval(row).clamp(*lo, *hi),
        }
    }

    /// Number of nodes in the tree
    #[must_use]
    pub fn node_count(&self) -> usize {
        match self {
            Self::Input(_) | Self::Const(_) => 1,
            Self::Unary(_, e) | Self::Clamp(e, _, _) => 1 + e.node_count(),
            Self::Binary(_, l, r) => 1 + l.node_count() + r.node_count(),
        }
    }
}

/// The haversine formula as an expression tree
///
/// Operation order mirrors [`haversine`] exactly.
#[must_use]
pub fn haversine_expr() -> Expr {
    use BinaryOp::{Add, Div, Mul, Sub};
    use UnaryOp::{Asin, Cos, Sin, Sqrt, Square};

    let radians = |e: Expr| Expr::binary(Mul, e, Expr::Const(DEG_TO_RAD));
    let input = Expr::Input;

    let lat0 = radians(input(Input::Y0));
    let lat1 = radians(input(Input::Y1));
    let delta_lat = radians(Expr::binary(Sub, input(Input::Y1), input(Input::Y0)));
    let delta_lon = radians(Expr::binary(Sub, input(Input::X1), input(Input::X0)));

    let half_sin_sq =
        |d: Expr| Expr::unary(Square, Expr::unary(Sin, Expr::binary(Div, d, Expr::Const(2.0))));

    let a = Expr::binary(
        Add,
        half_sin_sq(delta_lat),
        Expr::binary(
            Mul,
            Expr::binary(Mul, Expr::unary(Cos, lat0), Expr::unary(Cos, lat1)),
            half_sin_sq(delta_lon),
        ),
    );
    let central_angle = Expr::binary(
        Mul,
        Expr::Const(2.0),
        Expr::unary(Asin, Expr::Clamp(Box::new(Expr::unary(Sqrt, a)), -1.0, 1.0)),
    );

    Expr::binary(Mul, Expr::Const(EARTH_RADIUS_KM), central_angle)
}
