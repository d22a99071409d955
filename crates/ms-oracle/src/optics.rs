//! ---
//! ms_section: "11-simulation"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Physics oracle interface and bundled engines."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
//! Linear optics used by the lattice simulator.
//!
//! Coordinates follow the usual `(x, px, y, py, z, pz)` ordering. The
//! longitudinal block is kept at identity.

/// 6x6 linear transfer matrix, row major.
pub type Mat6 = [[f64; 6]; 6];

/// Identity transfer matrix.
pub fn identity() -> Mat6 {
    let mut m = [[0.0; 6]; 6];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    m
}

/// Field-free drift of length `l`.
pub fn drift(l: f64) -> Mat6 {
    let mut m = identity();
    m[0][1] = l;
    m[2][3] = l;
    m
}

/// Thick quadrupole of length `l` and normalised strength `k1`.
/// Positive `k1` focuses horizontally.
pub fn quadrupole(l: f64, k1: f64) -> Mat6 {
    if k1 == 0.0 {
        return drift(l);
    }
    let mut m = identity();
    let (focus, defocus) = if k1 > 0.0 { (0, 2) } else { (2, 0) };
    let sk = k1.abs().sqrt();
    let phase = sk * l;

    m[focus][focus] = phase.cos();
    m[focus][focus + 1] = phase.sin() / sk;
    m[focus + 1][focus] = -sk * phase.sin();
    m[focus + 1][focus + 1] = phase.cos();

    m[defocus][defocus] = phase.cosh();
    m[defocus][defocus + 1] = phase.sinh() / sk;
    m[defocus + 1][defocus] = sk * phase.sinh();
    m[defocus + 1][defocus + 1] = phase.cosh();
    m
}

/// Apply `m` to a phase-space vector.
pub fn apply(m: &Mat6, v: &[f64; 6]) -> [f64; 6] {
    let mut out = [0.0; 6];
    for (i, row) in m.iter().enumerate() {
        out[i] = row.iter().zip(v.iter()).map(|(a, b)| a * b).sum();
    }
    out
}

/// Twiss functions of one transverse plane at an element exit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneTwiss {
    pub beta: f64,
    pub alpha: f64,
    pub eta: f64,
    pub etap: f64,
    /// Accumulated betatron phase in radians.
    pub phi: f64,
}

impl PlaneTwiss {
    /// Start-of-line values with zero dispersion and phase.
    pub fn initial(beta: f64, alpha: f64) -> Self {
        Self {
            beta,
            alpha,
            eta: 0.0,
            etap: 0.0,
            phi: 0.0,
        }
    }

    fn gamma(&self) -> f64 {
        (1.0 + self.alpha * self.alpha) / self.beta
    }

    /// Propagate through the plane block of `m` starting at row `offset`
    /// (0 for the horizontal plane, 2 for the vertical plane).
    pub fn propagate(&self, m: &Mat6, offset: usize) -> Self {
        let r11 = m[offset][offset];
        let r12 = m[offset][offset + 1];
        let r21 = m[offset + 1][offset];
        let r22 = m[offset + 1][offset + 1];
        let r16 = m[offset][5];
        let r26 = m[offset + 1][5];
        let gamma = self.gamma();

        let beta = r11 * r11 * self.beta - 2.0 * r11 * r12 * self.alpha + r12 * r12 * gamma;
        let alpha = -r11 * r21 * self.beta + (r11 * r22 + r12 * r21) * self.alpha
            - r12 * r22 * gamma;
        let dphi = r12.atan2(r11 * self.beta - r12 * self.alpha);

        Self {
            beta,
            alpha,
            eta: r11 * self.eta + r12 * self.etap + r16,
            etap: r21 * self.eta + r22 * self.etap + r26,
            phi: self.phi + dphi,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det2(m: &Mat6, offset: usize) -> f64 {
        m[offset][offset] * m[offset + 1][offset + 1] - m[offset][offset + 1] * m[offset + 1][offset]
    }

    #[test]
    fn quadrupole_blocks_are_symplectic() {
        for k1 in [1.3, -0.7, 0.0] {
            let m = quadrupole(0.4, k1);
            assert!((det2(&m, 0) - 1.0).abs() < 1e-12);
            assert!((det2(&m, 2) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn drift_propagates_beta_quadratically() {
        let start = PlaneTwiss::initial(2.0, 0.0);
        let end = start.propagate(&drift(2.0), 0);
        // beta(s) = beta0 + s^2 / beta0 for a waist at s = 0
        assert!((end.beta - 4.0).abs() < 1e-12);
        assert!((end.alpha + 1.0).abs() < 1e-12);
        assert!(end.phi > 0.0);
    }

    #[test]
    fn apply_moves_offset_through_drift() {
        let out = apply(&drift(3.0), &[0.0, 1e-3, 0.0, 0.0, 0.0, 0.0]);
        assert!((out[0] - 3e-3).abs() < 1e-15);
        assert_eq!(out[1], 1e-3);
    }
}
