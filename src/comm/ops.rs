//! Stock combiners for all-reduce and scan collectives. Any
//! `Fn(&T, &T) -> T` works; these cover the common cases.

use std::ops::{Add, Mul};

pub fn minimum<T: PartialOrd + Clone>(a: &T, b: &T) -> T {
    if b < a {
        b.clone()
    } else {
        a.clone()
    }
}

pub fn maximum<T: PartialOrd + Clone>(a: &T, b: &T) -> T {
    if b > a {
        b.clone()
    } else {
        a.clone()
    }
}

pub fn plus<T: Add<Output = T> + Clone>(a: &T, b: &T) -> T {
    a.clone() + b.clone()
}

pub fn multiplies<T: Mul<Output = T> + Clone>(a: &T, b: &T) -> T {
    a.clone() * b.clone()
}

pub fn logical_and(a: &bool, b: &bool) -> bool {
    *a && *b
}

pub fn logical_or(a: &bool, b: &bool) -> bool {
    *a || *b
}
