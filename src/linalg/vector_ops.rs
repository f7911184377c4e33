use faer::{Col, ColMut, ColRef, unzip, zip};

use crate::E;

pub(crate) fn dot<'a>(x1: ColRef<'a, E>, x2: ColRef<'a, E>) -> E {
    let mut acc = 0.;
    zip!(x1, x2).for_each(|unzip!(x1, x2)| acc += *x1 * *x2);
    acc
}

/// `out += alpha * x`
pub(crate) fn axpy<'a>(out: ColMut<'a, E>, alpha: E, x: ColRef<'a, E>) {
    zip!(out, x).for_each(|unzip!(out, x)| *out += alpha * *x);
}

/// `out = a + alpha * b`
pub(crate) fn scaled_sum<'a>(out: ColMut<'a, E>, a: ColRef<'a, E>, alpha: E, b: ColRef<'a, E>) {
    zip!(out, a, b).for_each(|unzip!(out, a, b)| *out = *a + alpha * *b);
}

/// Componentwise projection of `x` onto `[low, upp]`.
pub(crate) fn clamp<'a>(x: ColMut<'a, E>, low: ColRef<'a, E>, upp: ColRef<'a, E>) {
    zip!(x, low, upp).for_each(|unzip!(x, low, upp)| {
        if *x < *low {
            *x = *low;
        } else if *x > *upp {
            *x = *upp;
        }
    });
}

pub(crate) fn cwise_inverse<'a>(x: ColRef<'a, E>) -> Col<E> {
    let mut out = Col::<E>::zeros(x.nrows());
    zip!(x, out.as_mut()).for_each(|unzip!(x, out)| *out = 1. / *x);
    out
}
