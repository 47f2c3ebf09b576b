use std::{
    ops::{Add, Div, Mul, Neg, Rem, Sub},
    sync::Arc,
};

use derive_more::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ScalarUnaryOp {
    Neg,
    Abs,
    Sign,
    Sqrt,
    Exp,
    Log,
    Floor,
    Ceil,
    Round,
    Trunc,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
}

impl ScalarUnaryOp {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Neg => -x,
            Self::Abs => x.abs(),
            Self::Sign if x == 0.0 || x.is_nan() => x,
            Self::Sign => x.signum(),
            Self::Sqrt => x.sqrt(),
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Floor => x.floor(),
            Self::Ceil => x.ceil(),
            Self::Round => x.round_ties_even(),
            Self::Trunc => x.trunc(),
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tan => x.tan(),
            Self::Asin => x.asin(),
            Self::Acos => x.acos(),
            Self::Atan => x.atan(),
            Self::Sinh => x.sinh(),
            Self::Cosh => x.cosh(),
            Self::Tanh => x.tanh(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ScalarBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Atan2,
}

impl ScalarBinaryOp {
    pub fn apply(self, x: f64, y: f64) -> f64 {
        match self {
            Self::Add => x + y,
            Self::Sub => x - y,
            Self::Mul => x * y,
            Self::Div => x / y,
            Self::Rem => x % y,
            Self::Pow => x.powf(y),
            Self::Atan2 => x.atan2(y),
        }
    }
}

/// A node of a scalar expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SExpr {
    Const(f64),
    Unary(ScalarUnaryOp, SVar),
    Binary(ScalarBinaryOp, SVar, SVar),
    Clamp { x: SVar, min: SVar, max: SVar },
    Lerp { a: SVar, b: SVar, weight: SVar },
}

impl SExpr {
    /// Evaluates the whole tree. Nothing is cached between calls.
    pub fn evaluate(&self) -> f64 {
        match self {
            SExpr::Const(x) => *x,
            SExpr::Unary(op, x) => op.apply(x.evaluate()),
            SExpr::Binary(op, x, y) => op.apply(x.evaluate(), y.evaluate()),
            SExpr::Clamp { x, min, max } => {
                let (x, min, max) = (x.evaluate(), min.evaluate(), max.evaluate());
                match x {
                    x if x < min => min,
                    x if x > max => max,
                    x => x,
                }
            }
            SExpr::Lerp { a, b, weight } => {
                let (a, b, weight) = (a.evaluate(), b.evaluate(), weight.evaluate());
                a + weight * (b - a)
            }
        }
    }
}

/// A shared handle to a scalar expression.
#[derive(Debug, Clone, PartialEq)]
pub struct SVar(Arc<SExpr>);

impl std::fmt::Display for SVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            SExpr::Const(x) => write!(f, "{x}"),
            SExpr::Unary(op, x) => write!(f, "{op}({x})"),
            SExpr::Binary(op, x, y) => write!(f, "{op}({x}, {y})"),
            SExpr::Clamp { x, min, max } => write!(f, "Clamp({x}, {min}, {max})"),
            SExpr::Lerp { a, b, weight } => write!(f, "Lerp({a}, {b}, {weight})"),
        }
    }
}

impl From<f64> for SVar {
    fn from(value: f64) -> Self {
        Self::new(SExpr::Const(value))
    }
}

impl From<f32> for SVar {
    fn from(value: f32) -> Self {
        Self::new(SExpr::Const(value as f64))
    }
}

impl SVar {
    pub fn new(expr: SExpr) -> Self {
        Self(Arc::new(expr))
    }

    #[inline]
    pub fn expr(&self) -> &SExpr {
        &self.0
    }

    #[inline]
    pub fn evaluate(&self) -> f64 {
        self.0.evaluate()
    }

    fn unary(&self, op: ScalarUnaryOp) -> Self {
        Self::new(SExpr::Unary(op, self.clone()))
    }

    fn binary(&self, op: ScalarBinaryOp, other: impl Into<SVar>) -> Self {
        Self::new(SExpr::Binary(op, self.clone(), other.into()))
    }

    pub fn abs(&self) -> Self {
        self.unary(ScalarUnaryOp::Abs)
    }

    /// `-1`, `0` or `1`; NaN stays NaN.
    pub fn sign(&self) -> Self {
        self.unary(ScalarUnaryOp::Sign)
    }

    pub fn sqrt(&self) -> Self {
        self.unary(ScalarUnaryOp::Sqrt)
    }

    pub fn exp(&self) -> Self {
        self.unary(ScalarUnaryOp::Exp)
    }

    /// Natural logarithm.
    pub fn log(&self) -> Self {
        self.unary(ScalarUnaryOp::Log)
    }

    pub fn floor(&self) -> Self {
        self.unary(ScalarUnaryOp::Floor)
    }

    pub fn ceil(&self) -> Self {
        self.unary(ScalarUnaryOp::Ceil)
    }

    /// Rounds half-way cases to the nearest even integer.
    pub fn round(&self) -> Self {
        self.unary(ScalarUnaryOp::Round)
    }

    pub fn trunc(&self) -> Self {
        self.unary(ScalarUnaryOp::Trunc)
    }

    pub fn sin(&self) -> Self {
        self.unary(ScalarUnaryOp::Sin)
    }

    pub fn cos(&self) -> Self {
        self.unary(ScalarUnaryOp::Cos)
    }

    pub fn tan(&self) -> Self {
        self.unary(ScalarUnaryOp::Tan)
    }

    pub fn asin(&self) -> Self {
        self.unary(ScalarUnaryOp::Asin)
    }

    pub fn acos(&self) -> Self {
        self.unary(ScalarUnaryOp::Acos)
    }

    pub fn atan(&self) -> Self {
        self.unary(ScalarUnaryOp::Atan)
    }

    pub fn sinh(&self) -> Self {
        self.unary(ScalarUnaryOp::Sinh)
    }

    pub fn cosh(&self) -> Self {
        self.unary(ScalarUnaryOp::Cosh)
    }

    pub fn tanh(&self) -> Self {
        self.unary(ScalarUnaryOp::Tanh)
    }

    pub fn pow(&self, exponent: impl Into<SVar>) -> Self {
        self.binary(ScalarBinaryOp::Pow, exponent)
    }

    pub fn clamp(&self, min: impl Into<SVar>, max: impl Into<SVar>) -> Self {
        Self::new(SExpr::Clamp {
            x: self.clone(),
            min: min.into(),
            max: max.into(),
        })
    }

    /// `a + weight * (b - a)`.
    pub fn lerp(a: impl Into<SVar>, b: impl Into<SVar>, weight: impl Into<SVar>) -> Self {
        Self::new(SExpr::Lerp {
            a: a.into(),
            b: b.into(),
            weight: weight.into(),
        })
    }

    /// Angle of the point `(x, y)`.
    pub fn atan2(y: impl Into<SVar>, x: impl Into<SVar>) -> Self {
        let y: SVar = y.into();
        y.binary(ScalarBinaryOp::Atan2, x)
    }
}

impl Neg for SVar {
    type Output = SVar;

    fn neg(self) -> Self::Output {
        self.unary(ScalarUnaryOp::Neg)
    }
}

impl Neg for &SVar {
    type Output = SVar;

    fn neg(self) -> Self::Output {
        self.unary(ScalarUnaryOp::Neg)
    }
}

macro_rules! impl_scalar_op {
    ($trait:ident, $fn:ident, $op:expr) => {
        impl<T: Into<SVar>> $trait<T> for SVar {
            type Output = SVar;

            fn $fn(self, rhs: T) -> Self::Output {
                self.binary($op, rhs)
            }
        }

        impl<T: Into<SVar>> $trait<T> for &SVar {
            type Output = SVar;

            fn $fn(self, rhs: T) -> Self::Output {
                self.binary($op, rhs)
            }
        }

        impl $trait<SVar> for f64 {
            type Output = SVar;

            fn $fn(self, rhs: SVar) -> Self::Output {
                SVar::from(self).binary($op, rhs)
            }
        }

        impl $trait<&SVar> for f64 {
            type Output = SVar;

            fn $fn(self, rhs: &SVar) -> Self::Output {
                SVar::from(self).binary($op, rhs.clone())
            }
        }
    };
}

impl_scalar_op!(Add, add, ScalarBinaryOp::Add);
impl_scalar_op!(Sub, sub, ScalarBinaryOp::Sub);
impl_scalar_op!(Mul, mul, ScalarBinaryOp::Mul);
impl_scalar_op!(Div, div, ScalarBinaryOp::Div);
impl_scalar_op!(Rem, rem, ScalarBinaryOp::Rem);

impl From<&SVar> for SVar {
    fn from(value: &SVar) -> Self {
        value.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use super::SVar;

    #[test]
    fn test_arithmetic() {
        let x = SVar::from(7.0);
        let y = SVar::from(2.0);
        assert_eq!((&x + &y).evaluate(), 9.0);
        assert_eq!((&x - 10.0).evaluate(), -3.0);
        assert_eq!((1.0 - &x).evaluate(), -6.0);
        assert_eq!((&x * &y / 4.0).evaluate(), 3.5);
        assert_eq!((&x % &y).evaluate(), 1.0);
        assert_eq!((-7.0 % y.clone()).evaluate(), -1.0);
        assert_eq!((-&x).evaluate(), -7.0);
        assert_eq!(x.pow(&y).evaluate(), 49.0);
    }

    #[test]
    fn test_functions() {
        let half = SVar::from(0.5);
        assert_eq!(half.round().evaluate(), 0.0);
        assert_eq!(SVar::from(1.5).round().evaluate(), 2.0);
        assert_eq!(SVar::from(2.5).round().evaluate(), 2.0);
        assert_eq!(SVar::from(-2.5).round().evaluate(), -2.0);
        assert_eq!(SVar::from(-2.7).trunc().evaluate(), -2.0);
        assert_eq!(SVar::from(-2.2).floor().evaluate(), -3.0);
        assert_eq!(SVar::from(-2.2).ceil().evaluate(), -2.0);

        assert_eq!(SVar::from(-3.0).sign().evaluate(), -1.0);
        assert_eq!(SVar::from(0.0).sign().evaluate(), 0.0);
        assert_eq!(SVar::from(-3.0).abs().evaluate(), 3.0);
        assert_eq!(SVar::from(9.0).sqrt().evaluate(), 3.0);
        assert_eq!(SVar::from(1.0).exp().log().evaluate(), 1.0);

        assert!((SVar::from(PI / 2.0).sin().evaluate() - 1.0).abs() < 1e-12);
        assert!((SVar::from(1.0).atan().evaluate() - PI / 4.0).abs() < 1e-12);
        assert!((SVar::atan2(1.0, -1.0).evaluate() - 3.0 * PI / 4.0).abs() < 1e-12);
        assert_eq!(SVar::from(0.0).tanh().evaluate(), 0.0);
        assert_eq!(SVar::from(0.0).cosh().evaluate(), 1.0);

        assert_eq!(SVar::from(5.0).clamp(0.0, 1.0).evaluate(), 1.0);
        assert_eq!(SVar::from(-5.0).clamp(0.0, 1.0).evaluate(), 0.0);
        assert_eq!(SVar::from(0.25).clamp(0.0, 1.0).evaluate(), 0.25);
        assert_eq!(SVar::lerp(2.0, 4.0, 0.25).evaluate(), 2.5);
    }

    #[test]
    fn test_shared_subtrees() {
        let x = SVar::from(3.0);
        let y = &x * &x + &x;
        assert_eq!(y.evaluate(), 12.0);
        assert_eq!(y.evaluate(), 12.0);
        assert_eq!(y.to_string(), "Add(Mul(3, 3), 3)");
    }
}
