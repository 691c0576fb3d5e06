//! IAM documents used by the identity setup step.

use serde_json::json;

/// Principal that EC2 instances assume roles as.
pub const EC2_SERVICE_PRINCIPAL: &str = "ec2.amazonaws.com";

/// Trust policy that lets only `service_principal` assume the role.
pub fn assume_role_policy(service_principal: &str) -> serde_json::Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Principal": {
                    "Service": service_principal
                },
                "Action": "sts:AssumeRole"
            }
        ]
    })
}

/// Derived name Cloud9 gives the instance backing an environment.
pub fn derived_instance_name(environment_name: &str, environment_id: &str) -> String {
    format!("aws-cloud9-{environment_name}-{environment_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_policy_restricts_to_service() {
        let policy = assume_role_policy(EC2_SERVICE_PRINCIPAL);
        let statements = policy["Statement"].as_array().unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0]["Principal"]["Service"], "ec2.amazonaws.com");
        assert_eq!(statements[0]["Action"], "sts:AssumeRole");
    }

    #[test]
    fn test_derived_instance_name() {
        assert_eq!(
            derived_instance_name("demo", "e-123"),
            "aws-cloud9-demo-e-123"
        );
    }
}
