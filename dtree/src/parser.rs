use std::str;

use nom::{
    branch::alt,
    bytes::complete::{escaped, is_a, is_not, tag, take_while_m_n},
    character::complete::{
        alphanumeric1, anychar, char, digit1, hex_digit1, multispace1, not_line_ending,
        oct_digit1, one_of,
    },
    combinator::{all_consuming, cut, map, map_res, not, opt, recognize, value},
    multi::{many0, many1, many_till, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    AsChar, Finish,
};
use nom_locate::LocatedSpan;

use crate::{ast::*, Error};

pub(crate) type Input<'a> = LocatedSpan<&'a [u8]>;

type IResult<'a, T> = nom::IResult<Input<'a>, T>;

/// Parse a Device Tree from a string.
pub fn from_str(s: &str) -> Result<Dts<'_>, Error> {
    parse_dts("<string>", s)
}

/// Parse a Device Tree source file, reporting errors against `file`.
pub(crate) fn parse_dts<'a>(file: &str, s: &'a str) -> Result<Dts<'a>, Error> {
    run(file, s, dts_file)
}

/// Parse a fragment included from within the body of a node.
pub(crate) fn parse_node_contents<'a>(file: &str, s: &'a str) -> Result<Vec<NodeItem<'a>>, Error> {
    run(file, s, node_contents)
}

fn run<'a, O>(
    file: &str,
    s: &'a str,
    parser: impl FnMut(Input<'a>) -> IResult<'a, O>,
) -> Result<O, Error> {
    match all_consuming(preceded(ws, parser))(Input::new(s.as_bytes())).finish() {
        Ok((_, out)) => Ok(out),
        Err(e) => {
            let near = String::from_utf8_lossy(e.input.fragment());
            Err(Error::Syntax {
                file: file.to_string(),
                line: e.input.location_line(),
                column: e.input.get_utf8_column(),
                near: near.lines().next().unwrap_or_default().chars().take(40).collect(),
            })
        }
    }
}

/// Parse a Device Tree source file.
fn dts_file(input: Input) -> IResult<Dts> {
    map(
        many0(alt((
            map(root_node, RootItem::Node),
            map(node_override, RootItem::Node),
            map(version_directive, RootItem::Version),
            map(include_directive, RootItem::Include),
            map(deleted_node, RootItem::DeleteNode),
            map(omit_if_no_ref, RootItem::OmitNode),
            map(memreserve, RootItem::MemReserve),
        ))),
        |items| Dts { items },
    )(input)
}

/// Parse a version directive.
fn version_directive(input: Input) -> IResult<DtsVersion> {
    map(terminated(dts_v1_keyword, cut(terminator)), |_| {
        DtsVersion::V1
    })(input)
}

/// Parse a valid root node.
///
/// The root node is a top-level named node in the file and its name should always be '/'.
fn root_node(input: Input) -> IResult<Node> {
    map(
        tuple((node_labels, root_node_name, node_body, cut(terminator))),
        |(labels, _, contents, _)| Node {
            id: NodeId::Name("/", None),
            labels,
            contents,
            ..Default::default()
        },
    )(input)
}

/// Parse a valid node override.
///
/// Node overrides are only valid in the top-level of the file and their name should be
/// a valid node reference.
fn node_override(input: Input) -> IResult<Node> {
    map(
        tuple((
            opt(omit_if_no_ref_keyword),
            node_labels,
            node_reference,
            node_body,
            cut(terminator),
        )),
        |(omit, labels, reference, contents, _)| Node {
            id: NodeId::Ref(reference),
            labels,
            contents,
            omit_if_no_ref: omit.is_some(),
        },
    )(input)
}

/// Parse a valid inner node.
///
/// Inner nodes are only valid within the body of a node. Their name should be a valid node name.
fn inner_node(input: Input) -> IResult<Node> {
    map(
        tuple((
            opt(omit_if_no_ref_keyword),
            node_labels,
            node_name,
            node_body,
            cut(terminator),
        )),
        |(omit, labels, id, contents, _)| Node {
            id,
            labels,
            contents,
            omit_if_no_ref: omit.is_some(),
        },
    )(input)
}

/// Recognize the name of a root node.
fn root_node_name(input: Input) -> IResult<Input> {
    lexeme(tag("/"))(input)
}

/// Parse the body of a device tree node.
fn node_body(input: Input) -> IResult<Vec<NodeItem>> {
    preceded(left_brace, cut(terminated(node_contents, right_brace)))(input)
}

/// Parse a list of node labels.
fn node_labels(input: Input) -> IResult<Vec<&str>> {
    many0(terminated(node_label, label_separator))(input)
}

/// Parse a node label.
fn node_label(input: Input) -> IResult<&str> {
    lexeme(text(node_label_str))(input)
}

/// Parse the contents of a node.
///
/// Directives come before properties: `#include` would otherwise be taken for a property name.
fn node_contents(input: Input) -> IResult<Vec<NodeItem>> {
    many0(alt((
        map(inner_node, NodeItem::Node),
        map(include_directive, NodeItem::Include),
        map(deleted_property, NodeItem::DeleteProperty),
        map(deleted_node, NodeItem::DeleteNode),
        map(property, NodeItem::Property),
    )))(input)
}

/// Parse a node property.
fn property(input: Input) -> IResult<Property> {
    map(
        tuple((
            prop_name,
            opt(preceded(assignment, cut(prop_values))),
            cut(terminator),
        )),
        |(name, value, _)| Property { name, value },
    )(input)
}

/// Parse a propery name.
fn prop_name(input: Input) -> IResult<&str> {
    lexeme(text(prop_name_str))(input)
}

/// Parse a property value list.
fn prop_values(input: Input) -> IResult<Vec<PropertyValue>> {
    separated_list1(
        list_separator,
        alt((
            prop_value_bits,
            prop_value_incbin,
            prop_value_cell_array,
            prop_value_bytestring,
            prop_value_alias,
            prop_value_str,
        )),
    )(input)
}

/// Parse a property value corresponding to the `/bits/` keyword followed by its arguments.
fn prop_value_bits(input: Input) -> IResult<PropertyValue> {
    map(
        tuple((
            bits_keyword,
            cut(lexeme(dec)),
            cut(delimited(left_chevron, prop_cells, right_chevron)),
        )),
        |(_, n, cells)| PropertyValue::Bits(n as u32, cells),
    )(input)
}

/// Parse a property value corresponding to the `/incbin/` keyword.
///
/// The file name may be followed by an offset and a length, both integer expressions.
fn prop_value_incbin(input: Input) -> IResult<PropertyValue> {
    map(
        preceded(
            incbin_keyword,
            cut(delimited(
                left_paren,
                pair(
                    lexeme(string_literal),
                    opt(preceded(
                        list_separator,
                        pair(terminated(integer_expr, list_separator), integer_expr),
                    )),
                ),
                right_paren,
            )),
        ),
        |(path, range)| PropertyValue::Incbin { path, range },
    )(input)
}

/// Parse a property value corresponding to a reference to another node.
fn prop_value_alias(input: Input) -> IResult<PropertyValue> {
    map(node_reference, PropertyValue::Ref)(input)
}

/// Parse a property value corresponding to a string.
fn prop_value_str(input: Input) -> IResult<PropertyValue> {
    lexeme(map(string_literal, PropertyValue::Str))(input)
}

/// Parse a property value corresponding to a cell array.
///
/// A cell array can be empty.
fn prop_value_cell_array(input: Input) -> IResult<PropertyValue> {
    map(
        preceded(left_chevron, cut(terminated(prop_cells, right_chevron))),
        PropertyValue::CellArray,
    )(input)
}

/// Parse the cells between a pair of chevrons.
fn prop_cells(input: Input) -> IResult<Vec<PropertyCell>> {
    many0(alt((prop_cell_expr, prop_cell_ref)))(input)
}

/// Parse a property value corresponding to a byte string.
fn prop_value_bytestring(input: Input) -> IResult<PropertyValue> {
    map(
        preceded(
            left_bracket,
            cut(terminated(many1(lexeme(hex_byte)), right_bracket)),
        ),
        PropertyValue::Bytestring,
    )(input)
}

/// Parse a property cell containing a reference to another node.
fn prop_cell_ref(input: Input) -> IResult<PropertyCell> {
    map(node_reference, PropertyCell::Ref)(input)
}

/// Parse a property cell containing an integer expression.
fn prop_cell_expr(input: Input) -> IResult<PropertyCell> {
    lexeme(map(integer_expr, PropertyCell::Expr))(input)
}

/// Parse a deleted node.
fn deleted_node(input: Input) -> IResult<NodeId> {
    delimited(
        delete_node_keyword,
        cut(alt((node_name, map(node_reference, NodeId::Ref)))),
        cut(terminator),
    )(input)
}

/// Parse a deleted property.
fn deleted_property(input: Input) -> IResult<&str> {
    delimited(delete_property_keyword, cut(prop_name), cut(terminator))(input)
}

/// Parse a valid memreserve directive.
fn memreserve(input: Input) -> IResult<(u64, u64)> {
    delimited(
        memreserve_keyword,
        cut(pair(numeric_literal, numeric_literal)),
        cut(terminator),
    )(input)
}

/// Parse a valid omitted node directive.
fn omit_if_no_ref(input: Input) -> IResult<NodeId> {
    delimited(
        omit_if_no_ref_keyword,
        cut(alt((node_name, map(node_reference, NodeId::Ref)))),
        cut(terminator),
    )(input)
}

/// Parse a valid node reference.
fn node_reference(input: Input) -> IResult<Reference> {
    let node_ref = map(
        alt((
            text(node_label_str),
            delimited(char('{'), text(node_path), char('}')),
        )),
        Reference,
    );

    lexeme(preceded(reference_operator, cut(node_ref)))(input)
}

/// Parse a valid node name.
///
/// A node name is composed of node-name part and an optional unit-address.
fn node_name(input: Input) -> IResult<NodeId> {
    lexeme(map(
        pair(text(node_name_str), opt(preceded(char('@'), cut(text(node_name_str))))),
        |(name, address)| NodeId::Name(name, address),
    ))(input)
}

/* === Integer expressions === */

/// Parse a valid top-level integer expression in a property cell.
///
/// Valid expressions include a single integer literal (e.g. `<0>`) or a parenthesized expression
/// (e.g. `<(1 << 1)>`).
fn integer_expr(input: Input) -> IResult<Expression> {
    alt((integer_expr_lit, integer_expr_parens))(input)
}

/// Parse a valid integer literal expression.
fn integer_expr_lit(input: Input) -> IResult<Expression> {
    map(integer_literal, Expression::Lit)(input)
}

/// Parse a valid parenthesized integer expression.
fn integer_expr_parens(input: Input) -> IResult<Expression> {
    preceded(left_paren, cut(terminated(expr_ternary, right_paren)))(input)
}

/// Parse a conditional expression, the lowest precedence level.
fn expr_ternary(input: Input) -> IResult<Expression> {
    map(
        pair(
            expr_logical_or,
            opt(preceded(
                lexeme(char('?')),
                cut(pair(terminated(expr_ternary, label_separator), expr_ternary)),
            )),
        ),
        |(cond, branches)| match branches {
            Some((left, right)) => Expression::Ternary {
                cond: Box::new(cond),
                left: Box::new(left),
                right: Box::new(right),
            },
            None => cond,
        },
    )(input)
}

fn expr_logical_or(input: Input) -> IResult<Expression> {
    binary_chain(expr_logical_and, value(BinaryOperator::Or, tag("||")))(input)
}

fn expr_logical_and(input: Input) -> IResult<Expression> {
    binary_chain(expr_bit_or, value(BinaryOperator::And, tag("&&")))(input)
}

fn expr_bit_or(input: Input) -> IResult<Expression> {
    binary_chain(
        expr_bit_xor,
        value(BinaryOperator::BitOr, terminated(char('|'), not(char('|')))),
    )(input)
}

fn expr_bit_xor(input: Input) -> IResult<Expression> {
    binary_chain(expr_bit_and, value(BinaryOperator::BitXor, char('^')))(input)
}

fn expr_bit_and(input: Input) -> IResult<Expression> {
    binary_chain(
        expr_equality,
        value(BinaryOperator::BitAnd, terminated(char('&'), not(char('&')))),
    )(input)
}

fn expr_equality(input: Input) -> IResult<Expression> {
    binary_chain(
        expr_comparison,
        alt((
            value(BinaryOperator::Eq, tag("==")),
            value(BinaryOperator::Neq, tag("!=")),
        )),
    )(input)
}

fn expr_comparison(input: Input) -> IResult<Expression> {
    binary_chain(
        expr_shift,
        alt((
            value(BinaryOperator::Le, tag("<=")),
            value(BinaryOperator::Ge, tag(">=")),
            value(BinaryOperator::Lt, terminated(char('<'), not(char('<')))),
            value(BinaryOperator::Gt, terminated(char('>'), not(char('>')))),
        )),
    )(input)
}

fn expr_shift(input: Input) -> IResult<Expression> {
    binary_chain(
        expr_sum,
        alt((
            value(BinaryOperator::LShift, tag("<<")),
            value(BinaryOperator::RShift, tag(">>")),
        )),
    )(input)
}

fn expr_sum(input: Input) -> IResult<Expression> {
    binary_chain(
        expr_product,
        alt((
            value(BinaryOperator::Add, char('+')),
            value(BinaryOperator::Sub, char('-')),
        )),
    )(input)
}

fn expr_product(input: Input) -> IResult<Expression> {
    binary_chain(
        expr_unary,
        alt((
            value(BinaryOperator::Mul, char('*')),
            value(BinaryOperator::Div, char('/')),
            value(BinaryOperator::Mod, char('%')),
        )),
    )(input)
}

/// Parse a unary expression, i.e. a primary expression prefixed by zero or more unary operators.
fn expr_unary(input: Input) -> IResult<Expression> {
    alt((
        map(
            pair(arith_operator_unary, cut(expr_unary)),
            |(op, operand)| Expression::Unary(op, Box::new(operand)),
        ),
        integer_expr,
    ))(input)
}

/// Parse a left-associative chain of operands joined by operators of the same precedence.
fn binary_chain<'a, P, O>(
    mut operand: P,
    operator: O,
) -> impl FnMut(Input<'a>) -> IResult<'a, Expression>
where
    P: FnMut(Input<'a>) -> IResult<'a, Expression>,
    O: FnMut(Input<'a>) -> IResult<'a, BinaryOperator>,
{
    let mut operator = lexeme(operator);

    move |input| {
        let (mut input, mut lhs) = operand(input)?;

        loop {
            match operator(input) {
                Ok((rest, op)) => {
                    let (rest, rhs) = cut(|i| operand(i))(rest)?;
                    lhs = Expression::Binary(Box::new(lhs), op, Box::new(rhs));
                    input = rest;
                }
                Err(nom::Err::Error(_)) => return Ok((input, lhs)),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Parse an integer or character literal.
fn integer_literal(input: Input) -> IResult<IntegerLiteral> {
    alt((
        map(numeric_literal, IntegerLiteral::Num),
        map(lexeme(char_literal), IntegerLiteral::Char),
    ))(input)
}

/// Parse a valid unsigned integer number in any base, with an optional C type suffix.
fn numeric_literal(input: Input) -> IResult<u64> {
    lexeme(terminated(
        alt((unsigned_hex, unsigned_oct, dec)),
        many0(one_of("uUlL")),
    ))(input)
}

/// Parse a valid character literal.
fn char_literal(input: Input) -> IResult<char> {
    delimited(
        char('\''),
        cut(alt((
            map(preceded(char('\\'), anychar), unescape_char),
            anychar,
        ))),
        cut(char('\'')),
    )(input)
}

/// Parse a valid include directive.
///
/// The parser recognizes both C-style include directives (i.e. `#include "foo.h"`)
/// and Devicetree-style include directives (i.e. `/include/ "foo.h"`).
fn include_directive(input: Input) -> IResult<Include> {
    alt((include_directive_cpp, include_directive_dts))(input)
}

/// Parse a valid C-style include directive.
fn include_directive_cpp(input: Input) -> IResult<Include> {
    let quoted = delimited(char('"'), text(include_path_str), char('"'));
    let bracketed = delimited(char('<'), text(include_path_str), char('>'));

    map(
        preceded(include_cpp_keyword, cut(lexeme(alt((quoted, bracketed))))),
        Include::C,
    )(input)
}

/// Parse a valid Devicetree-style include directive.
fn include_directive_dts(input: Input) -> IResult<Include> {
    map(
        preceded(
            include_dts_keyword,
            cut(lexeme(delimited(char('"'), text(include_path_str), char('"')))),
        ),
        Include::Dts,
    )(input)
}

/// Parse a valid string literal, returning its contents with escape sequences untouched.
fn string_literal(input: Input) -> IResult<&str> {
    preceded(char('"'), cut(terminated(text(string_body), char('"'))))(input)
}

/* === Low-level syntax parsers === */

/// Recognize an assigment operator.
fn assignment(input: Input) -> IResult<char> {
    lexeme(char('='))(input)
}

/// Recognize a statement terminator.
fn terminator(input: Input) -> IResult<char> {
    lexeme(char(';'))(input)
}

/// Recognize a list separator.
fn list_separator(input: Input) -> IResult<char> {
    lexeme(char(','))(input)
}

/// Recognize a label separator.
fn label_separator(input: Input) -> IResult<char> {
    lexeme(char(':'))(input)
}

/// Recognize an opening brace.
fn left_brace(input: Input) -> IResult<char> {
    lexeme(char('{'))(input)
}

/// Recognize a closing brace.
fn right_brace(input: Input) -> IResult<char> {
    lexeme(char('}'))(input)
}

/// Recognize an opening chevron.
fn left_chevron(input: Input) -> IResult<char> {
    lexeme(char('<'))(input)
}

/// Recognize a closing chevron.
fn right_chevron(input: Input) -> IResult<char> {
    lexeme(char('>'))(input)
}

/// Recognize an opening parenthesis.
fn left_paren(input: Input) -> IResult<char> {
    lexeme(char('('))(input)
}

/// Recognize a closing parenthesis.
fn right_paren(input: Input) -> IResult<char> {
    lexeme(char(')'))(input)
}

/// Recognize an opening bracket.
fn left_bracket(input: Input) -> IResult<char> {
    lexeme(char('['))(input)
}

/// Recognize a closing bracket.
fn right_bracket(input: Input) -> IResult<char> {
    lexeme(char(']'))(input)
}

/// Recognize a reference operator.
fn reference_operator(input: Input) -> IResult<char> {
    lexeme(char('&'))(input)
}

/// Recognize an arithmetic unary operator.
fn arith_operator_unary(input: Input) -> IResult<UnaryOperator> {
    lexeme(alt((
        value(UnaryOperator::Neg, char('-')),
        value(UnaryOperator::BitNot, char('~')),
        value(UnaryOperator::LogicalNot, terminated(char('!'), not(char('=')))),
    )))(input)
}

/// Parse an usigned integer number in base 16, prefixed by `0x`.
fn unsigned_hex(input: Input) -> IResult<u64> {
    map_res(
        preceded(alt((tag("0x"), tag("0X"))), cut(hex_digit1)),
        |s| radix(s, 16),
    )(input)
}

/// Parse an unsigned integer number in base 8, prefixed by `0`.
fn unsigned_oct(input: Input) -> IResult<u64> {
    map_res(preceded(char('0'), oct_digit1), |s| radix(s, 8))(input)
}

/// Parse an unsigned integer number in base 10.
fn dec(input: Input) -> IResult<u64> {
    map_res(digit1, |s| radix(s, 10))(input)
}

/// Parse a byte represented by two hex digits.
fn hex_byte(input: Input) -> IResult<u8> {
    map_res(take_while_m_n(2, 2, |c: u8| c.is_hex_digit()), |s| {
        radix(s, 16).map(|b| b as u8)
    })(input)
}

/// Recognize the body of a string literal, backslash escapes included.
fn string_body(input: Input) -> IResult<Input> {
    recognize(opt(escaped(is_not("\"\\"), '\\', anychar)))(input)
}

/// Recognize a valid path in an include directive.
fn include_path_str(input: Input) -> IResult<Input> {
    is_not("\"<>\r\n")(input)
}

/// Recognize a valid node name string.
fn node_name_str(input: Input) -> IResult<Input> {
    recognize(many1(alt((alphanumeric1, is_a(",._+-")))))(input)
}

/// Recognize a valid node label string.
fn node_label_str(input: Input) -> IResult<Input> {
    recognize(many1(alt((alphanumeric1, is_a("_")))))(input)
}

/// Recognize a valid node path.
fn node_path(input: Input) -> IResult<Input> {
    recognize(many1(preceded(
        char('/'),
        pair(node_name_str, opt(preceded(char('@'), node_name_str))),
    )))(input)
}

/// Recognize a valid property name string.
fn prop_name_str(input: Input) -> IResult<Input> {
    recognize(many1(alt((alphanumeric1, is_a(",._+?#-")))))(input)
}

/// Recognize a C preprocessor include directive prefix.
fn include_cpp_keyword(input: Input) -> IResult<Input> {
    lexeme(tag("#include"))(input)
}

/// Recognize a Devicetree include directive prefix.
fn include_dts_keyword(input: Input) -> IResult<Input> {
    lexeme(tag("/include/"))(input)
}

/// Recognize the `/bits/` keyword.
fn bits_keyword(input: Input) -> IResult<Input> {
    lexeme(tag("/bits/"))(input)
}

/// Recognize the `/incbin/` keyword.
fn incbin_keyword(input: Input) -> IResult<Input> {
    lexeme(tag("/incbin/"))(input)
}

/// Recognize the `/memreserve/` keyword.
fn memreserve_keyword(input: Input) -> IResult<Input> {
    lexeme(tag("/memreserve/"))(input)
}

/// Recognize the `/delete-node/` keyword.
fn delete_node_keyword(input: Input) -> IResult<Input> {
    lexeme(tag("/delete-node/"))(input)
}

/// Recognize the `/delete-property/` keyword.
fn delete_property_keyword(input: Input) -> IResult<Input> {
    lexeme(tag("/delete-property/"))(input)
}

/// Recognize the `/omit-if-no-ref/` keyword.
fn omit_if_no_ref_keyword(input: Input) -> IResult<Input> {
    lexeme(tag("/omit-if-no-ref/"))(input)
}

/// Recognize the `/dts-v1/` keyword.
fn dts_v1_keyword(input: Input) -> IResult<Input> {
    lexeme(tag("/dts-v1/"))(input)
}

/* === Utility functions === */

/// Parse a lexeme using the combinator passed as its argument,
/// also consuming any whitespaces or comments after it.
fn lexeme<'a, O, F>(f: F) -> impl FnMut(Input<'a>) -> IResult<'a, O>
where
    F: FnMut(Input<'a>) -> IResult<'a, O>,
{
    terminated(f, ws)
}

/// Turn a recognizer into a parser returning the recognized text.
fn text<'a, F>(f: F) -> impl FnMut(Input<'a>) -> IResult<'a, &'a str>
where
    F: FnMut(Input<'a>) -> IResult<'a, Input<'a>>,
{
    map_res(f, |s: Input<'a>| str::from_utf8(*s.fragment()))
}

/// Convert a run of digits already validated by a digit parser.
fn radix(digits: Input, radix: u32) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(str::from_utf8(digits.fragment()).unwrap_or_default(), radix)
}

/// Value of the character following a backslash in a character literal.
fn unescape_char(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        'a' => '\x07',
        'b' => '\x08',
        'v' => '\x0b',
        'f' => '\x0c',
        other => other,
    }
}

/// Consume zero or more whitespace characters or comments.
fn ws(input: Input) -> IResult<Input> {
    recognize(many0(alt((multispace1, line_comment, block_comment))))(input)
}

/// Parse block comments.
fn block_comment(input: Input) -> IResult<Input> {
    recognize(preceded(tag("/*"), cut(many_till(anychar, tag("*/")))))(input)
}

/// Parse a single line comment.
///
/// The parser stops just before the newline character but doesn't consume the newline.
fn line_comment(input: Input) -> IResult<Input> {
    recognize(preceded(tag("//"), not_line_ending))(input)
}

/* === Unit Tests === */
