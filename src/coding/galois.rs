//! GF(2^8) arithmetic over the polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11d).
//!
//! Addition is XOR. Multiplication goes through log/exp tables computed at
//! compile time; the exp table is doubled so `log a + log b` never wraps.

const POLYNOMIAL: u16 = 0x11d;

const fn build_tables() -> ([u8; 512], [u8; 256]) {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= POLYNOMIAL;
        }
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    (exp, log)
}

const TABLES: ([u8; 512], [u8; 256]) = build_tables();
static EXP: [u8; 512] = TABLES.0;
static LOG: [u8; 256] = TABLES.1;

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
}

/// Multiplicative inverse. `inv(0)` is defined as 0 so callers never panic;
/// the coding matrices never ask for it.
#[inline]
pub fn inv(a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    EXP[255 - LOG[a as usize] as usize]
}

#[inline]
pub fn div(a: u8, b: u8) -> u8 {
    mul(a, inv(b))
}

/// XOR `src` into `dest` in place, eight bytes at a time.
#[inline]
pub fn xor_into(dest: &mut [u8], src: &[u8]) {
    let len = dest.len().min(src.len());
    let words = len / 8;

    for i in 0..words {
        let offset = i * 8;
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&dest[offset..offset + 8]);
        b.copy_from_slice(&src[offset..offset + 8]);
        let folded = u64::from_le_bytes(a) ^ u64::from_le_bytes(b);
        dest[offset..offset + 8].copy_from_slice(&folded.to_le_bytes());
    }

    for i in (words * 8)..len {
        dest[i] ^= src[i];
    }
}

/// `dest ^= coefficient * src`, byte-wise. Coefficient 1 degenerates to plain XOR.
pub fn mul_xor_into(coefficient: u8, dest: &mut [u8], src: &[u8]) {
    match coefficient {
        0 => {}
        1 => xor_into(dest, src),
        c => {
            for (d, s) in dest.iter_mut().zip(src.iter()) {
                *d ^= mul(c, *s);
            }
        }
    }
}

/// Inverts a square matrix with Gauss-Jordan elimination. `None` if singular.
pub fn invert(matrix: &[Vec<u8>]) -> Option<Vec<Vec<u8>>> {
    let n = matrix.len();
    let mut work: Vec<Vec<u8>> = matrix.to_vec();
    let mut inverse: Vec<Vec<u8>> = (0..n)
        .map(|row| (0..n).map(|col| u8::from(row == col)).collect())
        .collect();

    for col in 0..n {
        let pivot = (col..n).find(|&row| work[row][col] != 0)?;
        work.swap(col, pivot);
        inverse.swap(col, pivot);

        let scale = inv(work[col][col]);
        for j in 0..n {
            let scaled = mul(work[col][j], scale);
            work[col][j] = scaled;
            let scaled = mul(inverse[col][j], scale);
            inverse[col][j] = scaled;
        }

        for row in 0..n {
            if row == col || work[row][col] == 0 {
                continue;
            }
            let factor = work[row][col];
            for j in 0..n {
                let pivot_term = mul(factor, work[col][j]);
                let inverse_term = mul(factor, inverse[col][j]);
                work[row][j] ^= pivot_term;
                inverse[row][j] ^= inverse_term;
            }
        }
    }

    Some(inverse)
}
