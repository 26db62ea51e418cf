use bus_protocol::{Coded, ErrorBody, error_kind};

use crate::error::BusResult;

/// An in-process bus message: the deserialized analogue of the wire
/// `Rmsg`, addressed by code rather than by codeid.
#[derive(Debug, Clone)]
pub struct BusMsg {
    pub sid: String,
    pub lsid: Option<String>,
    pub code: String,
    pub body: serde_json::Value,
}

/// One `(code, value)` pair a subfn wants published as a retval.
#[derive(Debug, Clone)]
pub struct PubItem {
    pub code: String,
    pub value: serde_json::Value,
}

impl PubItem {
    pub fn of<T: Coded>(body: &T) -> BusResult<Self> {
        Ok(Self {
            code: T::CODE.to_string(),
            value: serde_json::to_value(body)?,
        })
    }
}

/// An ordered list of retvals a single subfn invocation wants published.
/// Most subfns publish zero or one item; a pipeline stage can publish
/// several heterogeneous ones (e.g. an `Ok` plus a derived event).
#[derive(Debug, Clone, Default)]
pub struct PubList(pub Vec<PubItem>);

impl PubList {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn of<T: Coded>(body: T) -> BusResult<Self> {
        Ok(Self(vec![PubItem::of(&body)?]))
    }

    pub fn push<T: Coded>(mut self, body: T) -> BusResult<Self> {
        self.0.push(PubItem::of(&body)?);
        Ok(self)
    }
}

/// What a subfn invocation produced.
///
/// This is the Rust analogue of the original's untyped subfn return value:
/// a bare `Coded` value is the common "ok-wrap" case, `SkipMe` declines to
/// participate in this delivery (used by filters/conditions), and
/// `InterruptPipeline` halts delivery to the remaining subscribers of this
/// code after optionally publishing its own retvals first.
#[derive(Debug, Clone)]
pub enum SubFnRetval {
    /// Publish these retvals, then continue delivering to the next
    /// subscriber of this code.
    Publish(PubList),
    /// Publish nothing and continue delivering to the next subscriber.
    Skip,
    /// Publish these retvals, then stop delivering to any further
    /// subscriber of this code for this dispatch.
    Interrupt(PubList),
}

impl SubFnRetval {
    /// The common case: this subfn produced exactly one typed retval.
    pub fn ok<T: Coded>(body: T) -> BusResult<Self> {
        Ok(Self::Publish(PubList::of(body)?))
    }

    /// This subfn failed; publish an `ErrorBody` in its place.
    pub fn err(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let body = ErrorBody::new(kind, message);
        let item = PubItem {
            code: ErrorBody::CODE.to_string(),
            value: serde_json::to_value(&body).expect("ErrorBody always serializes"),
        };
        Self::Publish(PubList(vec![item]))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::err(error_kind::NOT_FOUND, message)
    }

    pub fn skip() -> Self {
        Self::Skip
    }

    pub fn interrupt(list: PubList) -> Self {
        Self::Interrupt(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Greeting {
        text: String,
    }
    impl Coded for Greeting {
        const CODE: &'static str = "app::greeting";
    }

    #[test]
    fn ok_wraps_a_single_typed_retval() {
        let retval = SubFnRetval::ok(Greeting {
            text: "hi".to_string(),
        })
        .unwrap();
        match retval {
            SubFnRetval::Publish(list) => {
                assert_eq!(list.0.len(), 1);
                assert_eq!(list.0[0].code, "app::greeting");
            }
            _ => panic!("expected Publish"),
        }
    }

    #[test]
    fn err_wraps_as_error_body_code() {
        let retval = SubFnRetval::err(error_kind::VALUE, "bad input");
        match retval {
            SubFnRetval::Publish(list) => {
                assert_eq!(list.0[0].code, ErrorBody::CODE);
            }
            _ => panic!("expected Publish"),
        }
    }

    #[test]
    fn pub_list_can_carry_heterogeneous_items() {
        let list = PubList::of(Greeting {
            text: "a".to_string(),
        })
        .unwrap()
        .push(Greeting {
            text: "b".to_string(),
        })
        .unwrap();
        assert_eq!(list.0.len(), 2);
    }
}
