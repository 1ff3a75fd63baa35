use linkerd2_proxy_api::{destination as pb, http_types};
use linkerd_destination_controller_core::profiles::{
    Profile, RequestMatch, ResponseClass, ResponseMatch, Route,
};

pub(super) fn to_profile(profile: &Profile) -> pb::DestinationProfile {
    pb::DestinationProfile {
        fully_qualified_name: profile.fully_qualified_name.clone(),
        opaque_protocol: profile.opaque_protocol,
        routes: profile.routes.iter().map(to_route).collect(),
        retry_budget: profile.retry_budget.as_ref().map(|budget| pb::RetryBudget {
            retry_ratio: budget.ratio,
            min_retries_per_second: budget.min_retries_per_second,
            ttl: Some(budget.ttl.try_into().unwrap_or_default()),
        }),
        dst_overrides: profile
            .dst_overrides
            .iter()
            .map(|dst| pb::WeightedDst {
                authority: dst.authority.clone(),
                weight: dst.weight,
                backend_ref: None,
            })
            .collect(),
        ..Default::default()
    }
}

fn to_route(route: &Route) -> pb::Route {
    pb::Route {
        condition: Some(to_request_match(&route.condition)),
        response_classes: route
            .response_classes
            .iter()
            .map(to_response_class)
            .collect(),
        metrics_labels: route.labels.clone().into_iter().collect(),
        is_retryable: route.retryable,
        timeout: route
            .timeout
            .map(|timeout| timeout.try_into().unwrap_or_default()),
    }
}

fn to_request_match(m: &RequestMatch) -> pb::RequestMatch {
    let inner = match m {
        RequestMatch::All(matches) => pb::request_match::Match::All(pb::request_match::Seq {
            matches: matches.iter().map(to_request_match).collect(),
        }),
        RequestMatch::Any(matches) => pb::request_match::Match::Any(pb::request_match::Seq {
            matches: matches.iter().map(to_request_match).collect(),
        }),
        RequestMatch::Not(inner) => {
            pb::request_match::Match::Not(Box::new(to_request_match(inner)))
        }
        RequestMatch::Path(regex) => pb::request_match::Match::Path(pb::PathMatch {
            regex: regex.clone(),
        }),
        RequestMatch::Method(method) => pb::request_match::Match::Method(to_http_method(method)),
    };
    pb::RequestMatch {
        r#match: Some(inner),
    }
}

fn to_response_class(class: &ResponseClass) -> pb::ResponseClass {
    pb::ResponseClass {
        condition: Some(to_response_match(&class.condition)),
        is_failure: class.is_failure,
    }
}

fn to_response_match(m: &ResponseMatch) -> pb::ResponseMatch {
    let inner = match m {
        ResponseMatch::All(matches) => pb::response_match::Match::All(pb::response_match::Seq {
            matches: matches.iter().map(to_response_match).collect(),
        }),
        ResponseMatch::Any(matches) => pb::response_match::Match::Any(pb::response_match::Seq {
            matches: matches.iter().map(to_response_match).collect(),
        }),
        ResponseMatch::Not(inner) => {
            pb::response_match::Match::Not(Box::new(to_response_match(inner)))
        }
        ResponseMatch::Status { min, max } => {
            pb::response_match::Match::Status(pb::HttpStatusRange {
                min: (*min).into(),
                max: (*max).into(),
            })
        }
    };
    pb::ResponseMatch {
        r#match: Some(inner),
    }
}

fn to_http_method(method: &http::Method) -> http_types::HttpMethod {
    use http_types::http_method::{Registered, Type};

    let typ = match *method {
        http::Method::GET => Type::Registered(Registered::Get.into()),
        http::Method::POST => Type::Registered(Registered::Post.into()),
        http::Method::PUT => Type::Registered(Registered::Put.into()),
        http::Method::DELETE => Type::Registered(Registered::Delete.into()),
        http::Method::PATCH => Type::Registered(Registered::Patch.into()),
        http::Method::OPTIONS => Type::Registered(Registered::Options.into()),
        http::Method::CONNECT => Type::Registered(Registered::Connect.into()),
        http::Method::HEAD => Type::Registered(Registered::Head.into()),
        http::Method::TRACE => Type::Registered(Registered::Trace.into()),
        ref other => Type::Unregistered(other.to_string()),
    };
    http_types::HttpMethod { r#type: Some(typ) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_controller_core::profiles::RetryBudget;
    use std::{collections::BTreeMap, time::Duration};

    #[test]
    fn translates_complete_profile() {
        let profile = Profile {
            fully_qualified_name: "web.emojivoto.svc.cluster.local".to_string(),
            routes: vec![Route {
                condition: RequestMatch::All(vec![
                    RequestMatch::Path("/books".to_string()),
                    RequestMatch::Method(http::Method::GET),
                ]),
                response_classes: vec![ResponseClass {
                    condition: ResponseMatch::Status { min: 500, max: 599 },
                    is_failure: true,
                }],
                retryable: true,
                timeout: Some(Duration::from_millis(300)),
                labels: BTreeMap::from([("route".to_string(), "GET /books".to_string())]),
            }],
            retry_budget: Some(RetryBudget {
                ratio: 0.2,
                min_retries_per_second: 10,
                ttl: Duration::from_secs(10),
            }),
            dst_overrides: vec![],
            opaque_protocol: false,
        };

        let wire = to_profile(&profile);
        assert_eq!(wire.fully_qualified_name, profile.fully_qualified_name);
        assert_eq!(wire.routes.len(), 1);

        let route = &wire.routes[0];
        assert!(route.is_retryable);
        assert_eq!(route.metrics_labels["route"], "GET /books");
        match route.condition.as_ref().and_then(|c| c.r#match.as_ref()) {
            Some(pb::request_match::Match::All(seq)) => {
                assert_eq!(seq.matches.len(), 2);
                assert!(seq.matches.iter().any(|m| matches!(
                    m.r#match,
                    Some(pb::request_match::Match::Path(ref path)) if path.regex == "/books"
                )));
            }
            m => panic!("unexpected condition: {m:?}"),
        }
        match &route.response_classes[0]
            .condition
            .as_ref()
            .and_then(|c| c.r#match.as_ref())
        {
            Some(pb::response_match::Match::Status(range)) => {
                assert_eq!((range.min, range.max), (500, 599));
            }
            m => panic!("unexpected condition: {m:?}"),
        }

        let budget = wire.retry_budget.as_ref().unwrap();
        assert_eq!(budget.min_retries_per_second, 10);
        assert_eq!(budget.ttl.as_ref().unwrap().seconds, 10);
    }

    #[test]
    fn translates_default_profile() {
        let profile = Profile {
            fully_qualified_name: "web.emojivoto.svc.cluster.local".to_string(),
            ..Default::default()
        };
        let wire = to_profile(&profile);
        assert!(wire.routes.is_empty());
        assert!(wire.retry_budget.is_none());
        assert!(wire.dst_overrides.is_empty());
        assert!(!wire.opaque_protocol);
    }

    #[test]
    fn translates_dst_overrides() {
        let profile = Profile {
            fully_qualified_name: "web.emojivoto.svc.cluster.local".to_string(),
            dst_overrides: vec![
                linkerd_destination_controller_core::profiles::WeightedDst {
                    authority: "web-v2.emojivoto.svc.cluster.local:8080".to_string(),
                    weight: 100,
                },
            ],
            ..Default::default()
        };
        let wire = to_profile(&profile);
        assert_eq!(wire.dst_overrides.len(), 1);
        assert_eq!(
            wire.dst_overrides[0].authority,
            "web-v2.emojivoto.svc.cluster.local:8080"
        );
        assert_eq!(wire.dst_overrides[0].weight, 100);
    }
}
