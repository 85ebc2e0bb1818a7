// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

/// What the authentication layer knows about the user, once
/// authenticated. The connection layer only needs the user's name and
/// uid (for instance, only root may forward privileged ports).
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// User name.
    pub user: String,
    /// Numeric user id of the account.
    pub uid: u32,
    /// Label of the last method tried, such as "publickey".
    pub method: Option<String>,
    /// Whether some method succeeded.
    pub authenticated: bool,
    failures: u32,
}

impl AuthContext {
    /// A context for `user`, not authenticated yet.
    pub fn new(user: &str, uid: u32) -> Self {
        AuthContext {
            user: user.to_string(),
            uid,
            method: None,
            authenticated: false,
            failures: 0,
        }
    }

    /// Record and log the result of an authentication attempt.
    pub fn report_result(&mut self, success: bool, method: &str) {
        self.method = Some(method.to_string());
        if success {
            info!("Accepted {} for {}", method, self.user);
            self.authenticated = true
        } else {
            self.failures += 1;
            info!("Failed {} for {} ({} failures)", method, self.user, self.failures);
        }
    }

    /// Number of failed attempts reported so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the user is the superuser.
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}
