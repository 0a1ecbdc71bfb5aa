// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! This module contains the `nom` parser for the policy language.

use crate::error::ParseError;
use base64::{engine::general_purpose::STANDARD as base64_engine, Engine};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while, take_while1},
    character::complete::{char, space0},
    combinator::{map, map_res, opt, recognize},
    multi::{many0, separated_list1},
    sequence::{delimited, preceded, separated_pair, terminated, tuple},
    IResult,
};
use std::{fmt, str::FromStr};

/// Comparison of `TPM2_PolicyNV`, encoded as `TPM_EO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvOperation {
    Eq = 0x0000,
    Neq = 0x0001,
    SignedGt = 0x0002,
    UnsignedGt = 0x0003,
    SignedLt = 0x0004,
    UnsignedLt = 0x0005,
    SignedGe = 0x0006,
    UnsignedGe = 0x0007,
    SignedLe = 0x0008,
    UnsignedLe = 0x0009,
    BitSet = 0x000A,
    BitClear = 0x000B,
}

const NV_OPERATIONS: [(NvOperation, &str); 12] = [
    (NvOperation::Eq, "eq"),
    (NvOperation::Neq, "neq"),
    (NvOperation::SignedGt, "sgt"),
    (NvOperation::UnsignedGt, "ugt"),
    (NvOperation::SignedLt, "slt"),
    (NvOperation::UnsignedLt, "ult"),
    (NvOperation::SignedGe, "sge"),
    (NvOperation::UnsignedGe, "uge"),
    (NvOperation::SignedLe, "sle"),
    (NvOperation::UnsignedLe, "ule"),
    (NvOperation::BitSet, "bitset"),
    (NvOperation::BitClear, "bitclear"),
];

impl From<NvOperation> for u16 {
    fn from(op: NvOperation) -> Self {
        op as u16
    }
}

impl TryFrom<u16> for NvOperation {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        NV_OPERATIONS
            .iter()
            .map(|(op, _)| *op)
            .find(|op| *op as u16 == value)
            .ok_or(value)
    }
}

impl FromStr for NvOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NV_OPERATIONS
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(op, _)| *op)
            .ok_or_else(|| format!("invalid operation: '{s}'"))
    }
}

impl fmt::Display for NvOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = NV_OPERATIONS
            .iter()
            .find(|(op, _)| op == self)
            .map_or("?", |(_, name)| name);
        f.write_str(name)
    }
}

/// The Abstract Syntax Tree (AST) for the policy language.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PolicyExpr {
    Pcr {
        selection: String,
        digest: Option<Vec<u8>>,
    },
    Secret {
        name: Box<PolicyExpr>,
        policy_ref: Option<Box<PolicyExpr>>,
    },
    Signed {
        name: Box<PolicyExpr>,
        policy_ref: Option<Box<PolicyExpr>>,
    },
    CommandCode(u32),
    AuthValue,
    Password,
    Nv {
        name: Box<PolicyExpr>,
        operand: Vec<u8>,
        offset: u16,
        op: NvOperation,
    },
    Or(Vec<PolicyExpr>),
    All(Vec<PolicyExpr>),
    TpmHandle(u32),
    Data {
        encoding: String,
        value: String,
    },
}

fn write_ref(f: &mut fmt::Formatter<'_>, policy_ref: Option<&PolicyExpr>) -> fmt::Result {
    if let Some(r) = policy_ref {
        write!(f, ", {r}")?;
    }
    write!(f, ")")
}

fn write_list(f: &mut fmt::Formatter<'_>, name: &str, items: &[PolicyExpr]) -> fmt::Result {
    let items: Vec<String> = items.iter().map(ToString::to_string).collect();
    write!(f, "{name}({})", items.join(", "))
}

impl fmt::Display for PolicyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pcr { selection, digest } => {
                write!(f, "pcr({selection}")?;
                if let Some(d) = digest {
                    write!(f, ", {}", hex::encode(d))?;
                }
                write!(f, ")")
            }
            Self::Secret { name, policy_ref } => {
                write!(f, "secret({name}")?;
                write_ref(f, policy_ref.as_deref())
            }
            Self::Signed { name, policy_ref } => {
                write!(f, "signed({name}")?;
                write_ref(f, policy_ref.as_deref())
            }
            Self::CommandCode(cc) => write!(f, "cc({cc:#x})"),
            Self::AuthValue => write!(f, "authvalue()"),
            Self::Password => write!(f, "password()"),
            Self::Nv {
                name,
                operand,
                offset,
                op,
            } => write!(f, "nv({name}, {}, {offset}, {op})", hex::encode(operand)),
            Self::Or(branches) => write_list(f, "or", branches),
            Self::All(items) => write_list(f, "all", items),
            Self::TpmHandle(handle) => write!(f, "tpm://{handle:#010x}"),
            Self::Data { encoding, value } => write!(f, "data://{encoding},{value}"),
        }
    }
}

impl PolicyExpr {
    /// Resolves a `data://` expression into bytes.
    ///
    /// # Errors
    ///
    /// Returns a `ParseError` if the expression is not a data URI or its value
    /// cannot be decoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        match self {
            Self::Data { encoding, value } => match encoding.as_str() {
                "utf8" => Ok(value.as_bytes().to_vec()),
                "hex" => Ok(hex::decode(value)?),
                "base64" => Ok(base64_engine.decode(value)?),
                _ => Err(ParseError::Custom(format!(
                    "unsupported data URI encoding: '{encoding}'"
                ))),
            },
            _ => Err(ParseError::Custom(format!("not a data URI: {self}"))),
        }
    }
}

fn is_hex_digit(c: char) -> bool {
    c.is_ascii_hexdigit()
}

fn is_dec_digit(c: char) -> bool {
    c.is_ascii_digit()
}

fn from_hex_str_u32(input: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(input, 16)
}

fn hex_u32(input: &str) -> IResult<&str, u32> {
    map_res(
        preceded(tag("0x"), take_while1(is_hex_digit)),
        from_hex_str_u32,
    )(input)
}

fn hex_bytes(input: &str) -> IResult<&str, Vec<u8>> {
    map_res(take_while1(is_hex_digit), hex::decode)(input)
}

fn dec_u16(input: &str) -> IResult<&str, u16> {
    map_res(take_while1(is_dec_digit), |s: &str| s.parse::<u16>())(input)
}

fn pcr_index(input: &str) -> IResult<&str, u32> {
    map_res(take_while1(is_dec_digit), |s: &str| s.parse::<u32>())(input)
}

fn pcr_list(input: &str) -> IResult<&str, Vec<u32>> {
    separated_list1(char(','), pcr_index)(input)
}

fn alg(input: &str) -> IResult<&str, &str> {
    alt((tag("sha1"), tag("sha256"), tag("sha384"), tag("sha512")))(input)
}

fn pcr_bank(input: &str) -> IResult<&str, String> {
    map(
        separated_pair(alg, char(':'), pcr_list),
        |(alg_str, indices)| {
            format!(
                "{}:{}",
                alg_str,
                indices
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            )
        },
    )(input)
}

fn pcr_selection_body(input: &str) -> IResult<&str, String> {
    map(separated_list1(char('+'), pcr_bank), |banks| {
        banks.join("+")
    })(input)
}

fn quoted_string(input: &str) -> IResult<&str, PolicyExpr> {
    map(
        delimited(char('\"'), recognize(many0(is_not("\""))), char('\"')),
        |s: &str| PolicyExpr::Data {
            encoding: "utf8".to_string(),
            value: s.to_string(),
        },
    )(input)
}

fn comma_sep<'a, F, O>(f: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    preceded(terminated(char(','), space0), f)
}

fn call<'a, F, O>(name: &'static str, f: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(
        terminated(tag(name), char('(')),
        delimited(space0, f, space0),
        char(')'),
    )
}

fn tpm_uri(input: &str) -> IResult<&str, PolicyExpr> {
    map(preceded(tag("tpm://"), hex_u32), PolicyExpr::TpmHandle)(input)
}

fn data_uri(input: &str) -> IResult<&str, PolicyExpr> {
    map(
        preceded(
            tag("data://"),
            separated_pair(
                alt((tag("utf8"), tag("hex"), tag("base64"))),
                char(','),
                take_while(|c: char| c != ',' && c != ')' && c != ';'),
            ),
        ),
        |(enc, val): (&str, &str)| PolicyExpr::Data {
            encoding: enc.to_string(),
            value: val.to_string(),
        },
    )(input)
}

fn name_argument(input: &str) -> IResult<&str, PolicyExpr> {
    alt((tpm_uri, data_uri))(input)
}

fn ref_argument(input: &str) -> IResult<&str, Box<PolicyExpr>> {
    map(alt((data_uri, quoted_string)), Box::new)(input)
}

fn pcr_expression(input: &str) -> IResult<&str, PolicyExpr> {
    map(
        tuple((pcr_selection_body, opt(comma_sep(hex_bytes)))),
        |(selection, digest)| PolicyExpr::Pcr { selection, digest },
    )(input)
}

fn secret_expression(input: &str) -> IResult<&str, PolicyExpr> {
    map(
        tuple((name_argument, opt(comma_sep(ref_argument)))),
        |(name, policy_ref)| PolicyExpr::Secret {
            name: Box::new(name),
            policy_ref,
        },
    )(input)
}

fn signed_expression(input: &str) -> IResult<&str, PolicyExpr> {
    map(
        tuple((name_argument, opt(comma_sep(ref_argument)))),
        |(name, policy_ref)| PolicyExpr::Signed {
            name: Box::new(name),
            policy_ref,
        },
    )(input)
}

fn nv_expression(input: &str) -> IResult<&str, PolicyExpr> {
    map(
        tuple((
            name_argument,
            comma_sep(hex_bytes),
            comma_sep(dec_u16),
            comma_sep(map_res(
                take_while1(|c: char| c.is_ascii_alphabetic()),
                str::parse::<NvOperation>,
            )),
        )),
        |(name, operand, offset, op)| PolicyExpr::Nv {
            name: Box::new(name),
            operand,
            offset,
            op,
        },
    )(input)
}

fn expression_list(input: &str) -> IResult<&str, Vec<PolicyExpr>> {
    separated_list1(terminated(char(','), space0), parse_policy_expr)(input)
}

/// Parses a single policy language expression.
///
/// # Errors
///
/// Returns a `nom::Err` if the input string does not match any known expression format.
pub fn parse_policy_expr(input: &str) -> IResult<&str, PolicyExpr> {
    alt((
        call("pcr", pcr_expression),
        call("secret", secret_expression),
        call("signed", signed_expression),
        call("cc", map(hex_u32, PolicyExpr::CommandCode)),
        map(call("authvalue", space0), |_| PolicyExpr::AuthValue),
        map(call("password", space0), |_| PolicyExpr::Password),
        call("nv", nv_expression),
        call("or", map(expression_list, PolicyExpr::Or)),
        call("all", map(expression_list, PolicyExpr::All)),
        tpm_uri,
        data_uri,
    ))(input)
}

/// Parses a `;` separated sequence of assertions, ensuring the entire input
/// is consumed. A sequence of more than one assertion is returned as
/// `PolicyExpr::All`.
///
/// # Errors
///
/// Returns a `ParseError` if the input is not a valid expression or if there is
/// trailing input left after parsing.
pub fn parse_policy(input: &str) -> Result<PolicyExpr, ParseError> {
    let sequence = separated_list1(
        delimited(space0, char(';'), space0),
        parse_policy_expr,
    );
    match delimited(space0, sequence, space0)(input) {
        Ok(("", mut exprs)) => {
            if exprs.len() == 1 {
                Ok(exprs.remove(0))
            } else {
                Ok(PolicyExpr::All(exprs))
            }
        }
        Ok((rem, _)) => Err(ParseError::Custom(format!(
            "unexpected trailing input: '{rem}'"
        ))),
        Err(e) => Err(ParseError::Custom(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sequence() {
        let expr = parse_policy("cc(0x15e); authvalue()").unwrap();
        assert_eq!(
            expr,
            PolicyExpr::All(vec![PolicyExpr::CommandCode(0x15e), PolicyExpr::AuthValue])
        );
    }

    #[test]
    fn test_display_round_trip() {
        let input = "or(all(pcr(sha256:0,7), password()), secret(tpm://0x40000001, data://utf8,ref))";
        let expr = parse_policy(input).unwrap();
        assert_eq!(parse_policy(&expr.to_string()).unwrap(), expr);
    }

    #[test]
    fn test_nv_operation_names() {
        for (op, name) in NV_OPERATIONS {
            assert_eq!(name.parse::<NvOperation>().unwrap(), op);
            assert_eq!(NvOperation::try_from(u16::from(op)).unwrap(), op);
        }
        assert!("lt".parse::<NvOperation>().is_err());
        assert_eq!(NvOperation::try_from(0x000c), Err(0x000c));
    }

    #[test]
    fn test_data_to_bytes() {
        let expr = parse_policy("data://base64,AAEC").unwrap();
        assert_eq!(expr.to_bytes().unwrap(), vec![0, 1, 2]);
        assert!(PolicyExpr::AuthValue.to_bytes().is_err());
    }
}
