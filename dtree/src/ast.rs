//! Syntax tree of a devicetree source file.
//!
//! The tree borrows every name and string from the source text. Items are kept in source order
//! since later statements override earlier ones (node merging, deletions).

use crate::Error;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dts<'s> {
    pub items: Vec<RootItem<'s>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootItem<'s> {
    Include(Include<'s>),
    Version(DtsVersion),
    Node(Node<'s>),
    OmitNode(NodeId<'s>),
    DeleteNode(NodeId<'s>),
    MemReserve((u64, u64)),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Include<'s> {
    C(&'s str),
    Dts(&'s str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtsVersion {
    V1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<'s> {
    pub id: NodeId<'s>,
    pub labels: Vec<&'s str>,
    pub contents: Vec<NodeItem<'s>>,
    pub omit_if_no_ref: bool,
}

impl<'s> Default for Node<'s> {
    fn default() -> Self {
        Self {
            id: NodeId::Name("", None),
            labels: Default::default(),
            contents: Default::default(),
            omit_if_no_ref: Default::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeId<'s> {
    Ref(Reference<'s>),
    Name(&'s str, Option<&'s str>),
}

impl<'s> NodeId<'s> {
    /// Full node name, including the unit-address if any.
    pub fn full_name(&self) -> String {
        match self {
            NodeId::Name(name, Some(addr)) => format!("{name}@{addr}"),
            NodeId::Name(name, None) => name.to_string(),
            NodeId::Ref(r) => format!("&{}", r.0),
        }
    }
}

/// A reference to a node, either by label (`&foo`) or by path (`&{/foo/bar}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference<'s>(pub &'s str);

impl<'s> Reference<'s> {
    pub fn is_path(&self) -> bool {
        self.0.starts_with('/')
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeItem<'s> {
    Property(Property<'s>),
    Node(Node<'s>),
    Include(Include<'s>),
    DeleteProperty(&'s str),
    DeleteNode(NodeId<'s>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property<'s> {
    pub name: &'s str,
    pub value: Option<Vec<PropertyValue<'s>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue<'s> {
    /// String literal, escape sequences still in place.
    Str(&'s str),
    Ref(Reference<'s>),
    Bytestring(Vec<u8>),
    CellArray(Vec<PropertyCell<'s>>),
    Bits(u32, Vec<PropertyCell<'s>>),
    Incbin {
        path: &'s str,
        range: Option<(Expression, Expression)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyCell<'s> {
    Ref(Reference<'s>),
    Expr(Expression),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Lit(IntegerLiteral),
    Unary(UnaryOperator, Box<Expression>),
    Binary(Box<Expression>, BinaryOperator, Box<Expression>),
    Ternary {
        cond: Box<Expression>,
        left: Box<Expression>,
        right: Box<Expression>,
    },
}

impl Expression {
    /// Evaluate the expression with the unsigned 64-bit arithmetic used by `dtc`.
    pub fn eval(&self) -> Result<u64, Error> {
        match self {
            Expression::Lit(l) => Ok(l.eval()),
            Expression::Unary(op, e) => Ok(op.eval(e.eval()?)),
            Expression::Binary(lhs, op, rhs) => op.eval(lhs.eval()?, rhs.eval()?),
            Expression::Ternary { cond, left, right } => {
                if cond.eval()? != 0 {
                    left.eval()
                } else {
                    right.eval()
                }
            }
        }
    }
}

impl From<u64> for Box<Expression> {
    fn from(i: u64) -> Self {
        Expression::Lit(IntegerLiteral::Num(i)).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegerLiteral {
    Num(u64),
    Char(char),
}

impl IntegerLiteral {
    pub fn eval(&self) -> u64 {
        match self {
            IntegerLiteral::Num(n) => *n,
            IntegerLiteral::Char(c) => *c as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Neg,
    BitNot,
    LogicalNot,
}

impl UnaryOperator {
    pub fn eval(&self, v: u64) -> u64 {
        match self {
            UnaryOperator::Neg => v.wrapping_neg(),
            UnaryOperator::BitNot => !v,
            UnaryOperator::LogicalNot => (v == 0) as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinaryOperator {
    pub fn eval(&self, l: u64, r: u64) -> Result<u64, Error> {
        Ok(match self {
            BinaryOperator::Add => l.wrapping_add(r),
            BinaryOperator::Sub => l.wrapping_sub(r),
            BinaryOperator::Mul => l.wrapping_mul(r),
            BinaryOperator::Div => l
                .checked_div(r)
                .ok_or_else(|| Error::Expression("division by zero".into()))?,
            BinaryOperator::Mod => l
                .checked_rem(r)
                .ok_or_else(|| Error::Expression("division by zero".into()))?,
            BinaryOperator::LShift => l.checked_shl(r as u32).unwrap_or(0),
            BinaryOperator::RShift => l.checked_shr(r as u32).unwrap_or(0),
            BinaryOperator::BitAnd => l & r,
            BinaryOperator::BitOr => l | r,
            BinaryOperator::BitXor => l ^ r,
            BinaryOperator::And => (l != 0 && r != 0) as u64,
            BinaryOperator::Or => (l != 0 || r != 0) as u64,
            BinaryOperator::Eq => (l == r) as u64,
            BinaryOperator::Neq => (l != r) as u64,
            BinaryOperator::Lt => (l < r) as u64,
            BinaryOperator::Gt => (l > r) as u64,
            BinaryOperator::Le => (l <= r) as u64,
            BinaryOperator::Ge => (l >= r) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_operators() {
        use BinaryOperator::*;
        use Expression::*;
        use UnaryOperator::*;

        for (expr, res) in [
            (Binary(1.into(), Add, 1.into()), 2),
            (Binary(2.into(), Sub, 3.into()), u64::MAX),
            (Unary(Neg, 1.into()), u64::MAX),
            (Unary(BitNot, 0xf.into()), !0xf),
            (Unary(LogicalNot, Unary(LogicalNot, 7.into()).into()), 1),
            (Binary(1.into(), LShift, 4.into()), 16),
            (Binary(7.into(), Mod, 4.into()), 3),
            (Binary(1.into(), LShift, 64.into()), 0),
            (
                Ternary {
                    cond: Binary(2.into(), Gt, 1.into()).into(),
                    left: 10.into(),
                    right: 20.into(),
                },
                10,
            ),
        ] {
            assert_eq!(res, expr.eval().unwrap());
        }
    }

    #[test]
    fn eval_division_by_zero() {
        let expr = Expression::Binary(1.into(), BinaryOperator::Div, 0.into());
        assert!(matches!(expr.eval(), Err(Error::Expression(_))));
    }

    #[test]
    fn char_literals_evaluate_to_code_point() {
        assert_eq!(IntegerLiteral::Char('A').eval(), 65);
    }
}
