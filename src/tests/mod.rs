
mod test_common_validation;
mod test_qps_controller_registry;
