//! Status classification of completed exchanges.
//!
//! Transport failures never get here: only a response the engine actually
//! obtained, after any redirects it followed, is classified.

/// Outcome of classifying a final status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Accepted,
    Rejected { status_code: u16 },
}

pub fn is_success(status_code: u16) -> bool {
    (200..300).contains(&status_code)
}

/// In simple mode only 2xx is accepted; otherwise everything is.
pub fn classify(status_code: u16, simple: bool) -> Classification {
    if !simple || is_success(status_code) {
        Classification::Accepted
    } else {
        Classification::Rejected { status_code }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_accepts_only_2xx() {
        for status in [200, 201, 204, 299] {
            assert_eq!(classify(status, true), Classification::Accepted, "{status}");
        }
        for status in [100, 199, 300, 304, 400, 404, 500, 503] {
            assert_eq!(
                classify(status, true),
                Classification::Rejected { status_code: status },
                "{status}"
            );
        }
    }

    #[test]
    fn non_simple_accepts_everything() {
        for status in [100, 200, 302, 404, 500, 599] {
            assert_eq!(classify(status, false), Classification::Accepted, "{status}");
        }
    }
}
