// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Symbolic-tree rendering for runtime entities.
//!
//! Every diagnostic-facing object in this crate renders to an atom-or-list tree. The machine form is compact (a
//! single space only where two adjacent atoms would otherwise merge); the human form is indented, one child per line.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    fmt,
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Lists whose machine form fits within this many characters render on a single line in the human form.
const PRETTY_INLINE_MAX: usize = 60;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A symbolic tree: an atom, or a list of symbolic trees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sexp {
    Atom(String),
    List(Vec<Sexp>),
}

/// Conversion into a symbolic tree.
pub trait ToSexp {
    fn to_sexp(&self) -> Sexp;
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Symbolic Trees
impl Sexp {
    /// Builds an atom from anything displayable.
    pub fn atom(value: impl fmt::Display) -> Self {
        Self::Atom(value.to_string())
    }

    /// Builds a list node.
    pub fn list(items: Vec<Sexp>) -> Self {
        Self::List(items)
    }

    /// Builds the conventional two-element `(name value)` field node.
    pub fn field(name: &str, value: Sexp) -> Self {
        Self::List(vec![Self::atom(name), value])
    }

    /// Renders the indented human form.
    pub fn to_pretty_string(&self) -> String {
        let mut out: String = String::new();
        self.render_pretty(&mut out, 0);
        out
    }

    fn render_pretty(&self, out: &mut String, indent: usize) {
        let machine: String = self.to_string();
        if machine.len() <= PRETTY_INLINE_MAX {
            out.push_str(&machine);
            return;
        }
        match self {
            Self::Atom(_) => out.push_str(&machine),
            Self::List(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push('\n');
                        for _ in 0..indent + 1 {
                            out.push(' ');
                        }
                    }
                    item.render_pretty(out, indent + 1);
                }
                out.push(')');
            },
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Quotes an atom when its raw form would be ambiguous inside a list.
fn escape_atom(atom: &str) -> String {
    let needs_quoting: bool =
        atom.is_empty() || atom.contains(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == '"');
    if needs_quoting {
        format!("{:?}", atom)
    } else {
        atom.to_string()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Machine-form rendering: compact, with a separator only between two adjacent atoms.
impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(atom) => write!(f, "{}", escape_atom(atom)),
            Self::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    let both_atoms: bool =
                        i > 0 && matches!(items[i - 1], Self::Atom(_)) && matches!(item, Self::Atom(_));
                    if both_atoms {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            },
        }
    }
}

impl ToSexp for Sexp {
    fn to_sexp(&self) -> Sexp {
        self.clone()
    }
}

impl ToSexp for () {
    fn to_sexp(&self) -> Sexp {
        Sexp::List(vec![])
    }
}

impl ToSexp for bool {
    fn to_sexp(&self) -> Sexp {
        Sexp::atom(self)
    }
}

impl ToSexp for String {
    fn to_sexp(&self) -> Sexp {
        Sexp::atom(self)
    }
}

impl ToSexp for &str {
    fn to_sexp(&self) -> Sexp {
        Sexp::atom(self)
    }
}

impl ToSexp for Duration {
    fn to_sexp(&self) -> Sexp {
        Sexp::atom(format!("{:?}", self))
    }
}

macro_rules! impl_to_sexp_for_integer {
    ($($t:ty),*) => {
        $(
            impl ToSexp for $t {
                fn to_sexp(&self) -> Sexp {
                    Sexp::atom(self)
                }
            }
        )*
    };
}

impl_to_sexp_for_integer!(i32, i64, u32, u64, usize);

impl<T: ToSexp> ToSexp for Option<T> {
    fn to_sexp(&self) -> Sexp {
        match self {
            None => Sexp::atom("None"),
            Some(value) => Sexp::List(vec![Sexp::atom("Some"), value.to_sexp()]),
        }
    }
}

impl<T: ToSexp> ToSexp for Vec<T> {
    fn to_sexp(&self) -> Sexp {
        Sexp::List(self.iter().map(ToSexp::to_sexp).collect())
    }
}

impl<T: ToSexp, E: ToSexp> ToSexp for Result<T, E> {
    fn to_sexp(&self) -> Sexp {
        match self {
            Ok(value) => Sexp::List(vec![Sexp::atom("Ok"), value.to_sexp()]),
            Err(error) => Sexp::List(vec![Sexp::atom("Err"), error.to_sexp()]),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
