//! Symmetric matrices in packed lower-triangular storage.
//!
//! A symmetric `$n\times n$` matrix `$\mathbf{A}$` is stored as the
//! `$n(n+1)/2$` elements of its lower triangle, row by row. Element
//! `$A_{ij}$` with `$i\geq j$` lives at offset `$i(i+1)/2 + j$`.
//!
//! The fitter keeps its dense Hessian and its inverse in this form and the
//! gradient callbacks registered with
//! [`Fitter::set_funcs`](../struct.Fitter.html#method.set_funcs) must fill
//! the Hessian using the same layout.
use alloc::vec;

use nalgebra::RealField;
use num_traits::Float;

/// Number of elements needed to store a symmetric `$n\times n$` matrix.
#[inline]
pub const fn matrix_len(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Offset of the element `$(i, j)$` in packed storage.
///
/// The matrix is symmetric so the indices may be given in either order.
#[inline]
pub fn index(i: usize, j: usize) -> usize {
    let (i, j) = if i >= j { (i, j) } else { (j, i) };
    i * (i + 1) / 2 + j
}

/// Compute the Cholesky decomposition `$\mathbf{A} = \mathbf{L}\mathbf{L}^\top$` in place.
///
/// On success `a` contains the lower triangular factor `$\mathbf{L}$`.
/// Returns `false` if the matrix is not positive definite; `a` is then
/// left partially overwritten.
pub fn cholesky_decompose<F: RealField + Float>(a: &mut [F], n: usize) -> bool {
    debug_assert!(a.len() >= matrix_len(n));
    for k in 0..n {
        let mut s = a[index(k, k)];
        for i in 0..k {
            let aki = a[index(k, i)];
            s -= aki * aki;
        }
        if !(s > F::zero()) {
            return false;
        }
        let s = Float::sqrt(s);
        a[index(k, k)] = s;

        for j in k + 1..n {
            let mut r = a[index(j, k)];
            for i in 0..k {
                r -= a[index(k, i)] * a[index(j, i)];
            }
            a[index(j, k)] = r / s;
        }
    }
    true
}

/// Solve `$\mathbf{L}\mathbf{L}^\top\vec{x} = \vec{b}$` in place.
///
/// `a` must be the factor computed by [`cholesky_decompose`]. The right hand
/// side `b` is replaced with the solution.
pub fn cholesky_solve<F: RealField + Float>(a: &[F], b: &mut [F], n: usize) {
    debug_assert!(a.len() >= matrix_len(n) && b.len() >= n);
    for j in 0..n {
        for i in 0..j {
            let bi = b[i];
            b[j] -= a[index(j, i)] * bi;
        }
        b[j] /= a[index(j, j)];
    }

    for j in (0..n).rev() {
        for i in j + 1..n {
            let bi = b[i];
            b[j] -= a[index(i, j)] * bi;
        }
        b[j] /= a[index(j, j)];
    }
}

/// Invert a symmetric positive definite matrix in place.
///
/// Unlike [`cholesky_solve`] this works on the original matrix, not on its
/// decomposition. Returns `false` if a non-positive pivot is encountered, in
/// which case the contents of `a` are undefined.
pub fn cholesky_invert<F: RealField + Float>(a: &mut [F], n: usize) -> bool {
    debug_assert!(a.len() >= matrix_len(n));
    if n == 0 {
        return true;
    }
    let mut x = vec![F::zero(); n];
    for k in (1..=n).rev() {
        let s = a[0];
        if !(s > F::zero()) {
            return false;
        }
        let mut m = 0;
        let mut q = 0;
        for i in 0..n - 1 {
            q = m + 1;
            m += i + 2;
            let t = a[q];
            x[i] = -t / s;
            if i + 1 >= k {
                x[i] = -x[i];
            }
            for j in q..m {
                a[j - (i + 1)] = a[j + 1] + t * x[j - q];
            }
        }
        a[m] = F::one() / s;
        for i in 0..n - 1 {
            a[q + i] = x[i];
        }
    }
    true
}

/// Multiply a vector by a symmetric packed matrix in place.
pub fn multiply<F: RealField + Float>(a: &[F], v: &mut [F], n: usize) {
    debug_assert!(a.len() >= matrix_len(n) && v.len() >= n);
    let mut out = vec![F::zero(); n];
    for (i, o) in out.iter_mut().enumerate() {
        for j in 0..n {
            *o += a[index(i, j)] * v[j];
        }
    }
    v[..n].copy_from_slice(&out);
}

/// Compute the bilinear form `$\vec{x}^\top\mathbf{A}\vec{y}$`.
pub fn dot_product<F: RealField + Float>(a: &[F], x: &[F], y: &[F], n: usize) -> F {
    debug_assert!(a.len() >= matrix_len(n));
    let mut s = F::zero();
    let mut k = 0;
    for i in 0..n {
        for j in 0..i {
            s += a[k] * (x[i] * y[j] + x[j] * y[i]);
            k += 1;
        }
        s += a[k] * x[i] * y[i];
        k += 1;
    }
    s
}
