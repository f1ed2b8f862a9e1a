use crate::{AdmissionDecision, FlowDirection, WindowSizeMs};

#[test]
fn window_size_ms_try_from_validates_nonzero() {
    let w = WindowSizeMs::try_from(250u64).unwrap();
    assert_eq!(*w, 250u64);

    assert_eq!(
        WindowSizeMs::try_from(0u64).unwrap_err(),
        "Window size must be greater than 0"
    );
}

#[test]
fn window_size_ms_defaults_to_one_second() {
    assert_eq!(*WindowSizeMs::default(), 1000u64);
}

#[test]
fn flow_direction_property_segments() {
    assert_eq!(FlowDirection::Provider.to_string(), "provider");
    assert_eq!(FlowDirection::Consumer.to_string(), "consumer");
}

#[test]
fn admission_decision_is_allowed() {
    assert!(AdmissionDecision::Allowed.is_allowed());
    assert!(
        !AdmissionDecision::Rejected {
            key: "k".to_string(),
            limit: 1,
            retry_after_ms: 10,
        }
        .is_allowed()
    );
}
